pub mod client;
pub mod models;

pub use client::{HasuraClient, HasuraError, MetadataClient};
pub use models::{ConnectionParameters, ForeignKey, Metadata, PermissionType, ALL_PERMISSIONS};
