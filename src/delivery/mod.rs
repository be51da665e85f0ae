mod agent;
pub mod backoff;
pub mod clock;
mod controller;
pub mod remote;

pub use agent::{delivery_loop, DeliveryAgent, DeliveryEvent, DeliveryPolicy, DrainReport};
pub use backoff::BackoffPolicy;
pub use clock::{Clock, SystemClock};
pub use controller::DeliveryController;
pub use remote::{DeliveryOutcome, RemoteStore, RestRemote};
