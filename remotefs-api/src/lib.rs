mod client;

pub use client::{
    DiskInfo, ListingPage, OperationStatus, RemoteClient, RemoteError, Resource, ResourceType,
    TransferLink,
};
