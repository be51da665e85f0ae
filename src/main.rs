use std::process;

#[tokio::main]
async fn main() {
    if let Err(err) = fieldcheck_lib::run().await {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}
