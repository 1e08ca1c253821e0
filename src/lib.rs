//! OpenStack provider for the Secrets Store CSI driver.
//!
//! Instead of fetching stored secrets, every mount mints fresh OpenStack
//! application credentials through the identity service and renders them
//! into files (a `clouds.yaml` by default) using caller-supplied templates.
//!
//! The pipeline is:
//!
//! 1. [`request`] validates the driver request and decodes its JSON fields.
//! 2. [`manifest`] reads the ordered `applicationCredentials` list.
//! 3. [`mount`] issues one credential per entry through a
//!    [`broker::CredentialBroker`] and renders it with [`template`].
//! 4. [`server`] returns the files to the driver over gRPC.

pub mod broker;
pub mod config;
pub mod manifest;
pub mod mount;
pub mod openstack;
pub mod request;
pub mod server;
pub mod template;
