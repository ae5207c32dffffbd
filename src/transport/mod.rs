// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire seams: the authenticated REST transport and the unauthenticated
//! document source, with a `reqwest` implementation and an in-memory fake.

pub mod http;
pub mod memory;
pub mod traits;

pub use traits::{
    ApiRequest, ApiResponse, ApiTransport, ChunkReader, DocumentSource, Method, SourceResponse, Validators,
};
