#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Resolution and fetching of opam packages for an npm-style package manager.
//!
//! The pipeline keeps a shallow checkout of the opam metadata repository,
//! an override repository and the opam archive URL index in a local cache,
//! turns each package version into a normalized [`Manifest`], picks
//! versions for range requests and materializes packages into the cache.
//!
//! [`OpamResolver`] ties the pieces together.

pub mod archive;
pub mod checkout;
pub mod collector;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod manifest;
pub mod opam;
pub mod overrides;
pub mod paths;
pub mod process;
pub mod range;
pub mod reference;
pub mod resolver;
pub mod sync;
pub mod url_index;
pub mod version;

pub use checkout::RepositoryCheckout;
pub use collector::{get_manifest_collection, CollectorContext, ManifestCollection};
pub use config::{NetworkMode, OpamConfig};
pub use error::{OpamError, Result};
pub use fetcher::{FetchResult, Fetcher};
pub use manifest::Manifest;
pub use overrides::{OverrideRecord, OverrideStore};
pub use paths::CacheLayout;
pub use process::{CommandRunner, SystemRunner};
pub use range::{satisfies, VersionRange};
pub use reference::{is_opam_pattern, parse_reference, parse_resolution, tarball_filename};
pub use resolver::{choose_version, OpamResolver};
pub use sync::{sync_repository, SyncOptions};
pub use url_index::{UrlIndex, UrlIndexCache};
pub use version::VERSION;
