//! Warden Client Library
//!
//! Typed Rust clients for Warden's two admission-control gRPC surfaces:
//! the Envoy external-authorization check (full payload inspection) and
//! the rate-limit-service check (descriptor-only debits).
//!
//! # Examples
//!
//! ```no_run
//! use warden_client::WardenClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client =
//!         WardenClient::connect("http://localhost:50051", "http://localhost:50052").await?;
//!
//!     let outcome = client
//!         .check_remote_write("acme", payload(), Some("snappy"))
//!         .await?;
//!     if outcome.allowed {
//!         println!("write admitted");
//!     } else {
//!         println!("write denied: {:?}", outcome.reason);
//!     }
//!     Ok(())
//! }
//! # fn payload() -> Vec<u8> { Vec::new() }
//! ```

pub mod client;
pub mod error;

pub use client::{CheckOutcome, RateLimitOutcome, WardenClient};
pub use error::{ClientError, Result};

// Generated protobuf code. The module tree mirrors the proto packages.
pub mod proto {
    pub mod envoy {
        pub mod config {
            pub mod core {
                pub mod v3 {
                    tonic::include_proto!("envoy.config.core.v3");
                }
            }
        }

        pub mod r#type {
            pub mod v3 {
                tonic::include_proto!("envoy.r#type.v3");
            }
        }

        pub mod extensions {
            pub mod common {
                pub mod ratelimit {
                    pub mod v3 {
                        tonic::include_proto!("envoy.extensions.common.ratelimit.v3");
                    }
                }
            }
        }

        pub mod service {
            pub mod auth {
                pub mod v3 {
                    tonic::include_proto!("envoy.service.auth.v3");
                }
            }

            pub mod ratelimit {
                pub mod v3 {
                    tonic::include_proto!("envoy.service.ratelimit.v3");
                }
            }
        }
    }

    pub mod google {
        pub mod rpc {
            tonic::include_proto!("google.rpc");
        }
    }
}
