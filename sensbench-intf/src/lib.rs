// Copyright (c) Facebook, Inc. and its affiliates.
use sb_util::*;

pub mod args;
pub mod metadata;
pub mod phase;

pub use args::{Args, Sweep, ENV_PREFIX};
pub use metadata::{MetadataKind, MetadataRecord};
pub use phase::{sanitize_tag_value, PhaseDescriptor, TAG_EXPERIMENT_ID};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
    pub static ref FULL_VERSION: String = full_version(*VERSION);
}
