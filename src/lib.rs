//! # docchat
//!
//! Retrieval-augmented chat over a local library of PDF and EPUB documents.
//!
//! Documents are hashed, parsed into text and images, chunked with overlap,
//! embedded through a local Ollama instance, and stored in SQLite. At query
//! time the question is embedded once and searched against two independent
//! vector spaces (text chunks and image captions); the hits are rendered into
//! a bounded context block and sent to a generation model.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────┐   ┌──────────┐
//! │ PDF/EPUB  │──▶│ hash → parse → chunk │──▶│  SQLite   │
//! │   files   │   │  → embed (text/img)  │   │ BLOB vecs │
//! └───────────┘   └──────────────────────┘   └────┬─────┘
//!                                                 │
//!                 ┌────────────┐   ┌─────────┐    │
//!   question ───▶ │ Retriever  │──▶│ Context │ ◀──┘
//!                 └────────────┘   └────┬────┘
//!                                       ▼
//!                                 ┌───────────┐
//!                                 │  Ollama   │
//!                                 └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and cancellation helpers |
//! | [`models`] | Core data types |
//! | [`hash`] | Streaming SHA-256 file fingerprints |
//! | [`chunk`] | Word chunker with percentage overlap |
//! | [`extract`] | PDF and EPUB parsing |
//! | [`embedding`] | Text embedding backend and vector helpers |
//! | [`image_embed`] | Image captioning with placeholder fallback |
//! | [`store`] | Storage trait, SQLite and in-memory backends |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`ingest`] | Ingestion pipeline |
//! | [`progress`] | Ingestion progress reporting |
//! | [`retrieve`] | Dual-space retrieval and keyword filtering |
//! | [`context`] | Context and prompt assembly |
//! | [`generate`] | Generation backend client |
//! | [`chat`] | Question/answer turns |
//! | [`documents`] | Document listing and deletion |
//! | [`stats`] | Library statistics |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod hash;
pub mod image_embed;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retrieve;
pub mod stats;
pub mod store;
