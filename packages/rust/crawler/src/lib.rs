//! Resource fetching: rendering, conversion, extraction, and the
//! idempotent fetch wrapper.
//!
//! This crate provides:
//! - [`Renderer`] with [`HttpRenderer`] and [`ChromeRenderer`]
//! - [`DocumentConverter`] with the pandoc round trip
//! - [`extract`] for links, media, and readable text
//! - [`ResourceFetcher`], which caches artifacts per address and tracks
//!   each address's fetch state

pub mod convert;
pub mod extract;
pub mod fetcher;
pub mod render;
pub mod scratch;

pub use convert::{DocumentConverter, PandocConverter, strip_fenced_divs};
pub use fetcher::{FetchEvent, ResourceFetcher};
pub use render::{ChromeRenderer, HttpRenderer, RenderedPage, Renderer, tail};
pub use scratch::{ScratchDir, ScratchFile, sweep_stale};
