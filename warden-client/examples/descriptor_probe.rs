//! Hammers the rate-limit-service surface with descriptor-only checks
//! until the tenant's bucket refuses, to eyeball the configured limit.
//!
//!     cargo run --example descriptor_probe

use warden_client::WardenClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut client =
        WardenClient::connect("http://localhost:50051", "http://localhost:50052").await?;

    let mut admitted: u64 = 0;
    loop {
        let outcome = client
            .should_rate_limit("remote-write", "probe-tenant", 100)
            .await?;
        if outcome.over_limit {
            println!("over limit after {admitted} admitted batches of 100");
            break;
        }
        admitted += 1;
        if admitted % 10 == 0 {
            println!("{admitted} batches admitted so far");
        }
        if admitted >= 10_000 {
            println!("tenant looks unlimited, stopping");
            break;
        }
    }
    Ok(())
}
