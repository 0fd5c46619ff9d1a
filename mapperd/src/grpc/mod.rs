//! The device-management RPC surface: generated protocol types, the
//! UDS server the control plane calls, and the client/reporting side
//! the mapper uses to talk back.

pub mod client;
pub mod server;

pub mod v1beta1 {
    #![allow(clippy::all)]

    tonic::include_proto!("v1beta1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("v1beta1_descriptor");
}
