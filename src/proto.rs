//! Generated protobuf types for the SM ↔ CM stream.

#![allow(clippy::enum_variant_names)]

pub mod servicemanager {
    tonic::include_proto!("servicemanager.v4");
}

pub use servicemanager::*;
