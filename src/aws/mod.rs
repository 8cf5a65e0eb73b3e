// file: src/aws/mod.rs
// version: 1.0.0
// guid: 9e5b1d3f-7c2a-4f84-a6e0-4d5e6f7a8b9c

//! Amazon Web Services publishing

pub mod client;
pub mod ec2;
pub mod marketplace;
pub mod pipeline;
pub mod s3;
pub mod sigv4;
pub mod ssm;

pub use client::AwsClient;
pub use pipeline::{Ec2Pipeline, Ec2Target, RegionSelection};
pub use sigv4::AwsCredentials;
