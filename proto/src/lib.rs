//! Generated gRPC types for the dictaflow daemon protocol.

tonic::include_proto!("dictaflow");
