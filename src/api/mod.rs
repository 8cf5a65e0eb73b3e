// file: src/api/mod.rs
// version: 1.0.0
// guid: 5e9a1c3b-8d4f-4f2e-a7b6-0c1d2e3f4a58

//! Versioned document model: metadata, typed documents and the schema registry

pub mod documents;
pub mod meta;
pub mod registry;
pub mod wellknown;

pub use documents::{
    AnyDocument, Build, BuildData, Document, ImageConfigDocument, List, Package,
    ToolConfigDocument, Upload, UploadData,
};
pub use meta::{ObjectMeta, TypeMeta};
pub use registry::{dump_typed, load, to_canonical_string, Registry, UnknownPolicy};
