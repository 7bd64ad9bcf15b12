//! Shared types, error model, and configuration for refeed.
//!
//! This crate is the foundation depended on by all other refeed crates.
//! It provides:
//! - [`RefeedError`], the unified error type
//! - Domain types ([`ArticleRecord`], [`ResourceArtifact`], [`SummaryRecord`], [`FetchState`])
//! - [`ResourceKey`] derivation and the store key-space
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod keys;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ArtifactBackend, ClustererConfig, DefaultsConfig, DigestSource, FeedSource,
    LlmConfig, RendererConfig, RendererKind, StorageConfig, WorkerConfig, WorkersConfig, api_key,
    config_dir, config_file_path, expand_home, init_config, init_config_at, load_config,
    load_config_from,
};
pub use error::{RefeedError, Result};
pub use keys::{ResourceKey, space};
pub use types::{
    ArticleKey, ArticleRecord, DiscoveredLink, ExtraData, FeedSnapshot, FetchState, MediaKind,
    MediaRef, ReadableText, ResourceArtifact, SummaryRecord, Tag,
};
