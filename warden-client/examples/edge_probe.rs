//! Sends synthetic remote-writes through the ext_authz surface and
//! prints the verdicts.
//!
//! Run a warden-service locally, then:
//!     cargo run --example edge_probe

use prost::Message;
use warden_client::WardenClient;
use warden_core::remote_write::{Label, Sample, TimeSeries, WriteRequest};

fn payload(samples: usize) -> Vec<u8> {
    let request = WriteRequest {
        timeseries: vec![TimeSeries {
            labels: vec![Label {
                name: "__name__".to_string(),
                value: "probe_requests_total".to_string(),
            }],
            samples: (0..samples)
                .map(|i| Sample {
                    value: i as f64,
                    timestamp: 1_700_000_000_000 + i as i64,
                })
                .collect(),
        }],
    };
    let mut raw = Vec::new();
    request.encode(&mut raw).expect("encode");
    snap::raw::Encoder::new().compress_vec(&raw).expect("compress")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut client =
        WardenClient::connect("http://localhost:50051", "http://localhost:50052").await?;

    for batch in [100, 1_000, 10_000] {
        let outcome = client
            .check_remote_write("probe-tenant", payload(batch), Some("snappy"))
            .await?;
        println!(
            "{batch:>6} samples -> allowed={} reason={:?} status={:?}",
            outcome.allowed, outcome.reason, outcome.http_status
        );
    }
    Ok(())
}
