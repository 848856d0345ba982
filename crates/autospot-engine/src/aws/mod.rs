//! AWS access layer: shared context, narrow client traits and error
//! classification. The engine consumes the cloud through [`ec2::Ec2Ops`]
//! and [`autoscaling::AutoScalingOps`] so tests can substitute fakes.

pub mod autoscaling;
pub mod context;
pub mod ec2;
pub mod error;
pub mod sqs;
