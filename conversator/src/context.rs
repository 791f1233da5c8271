//! Pointer-first context lookup contract.
//!
//! The retrieval store itself is an external collaborator; the core only
//! speaks this trait and stores the returned paths as pointers (never the
//! content). The freeze path consults it to seed the execution contract's
//! context pointers. Deployments plug in a real implementation; the default
//! returns nothing.

use async_trait::async_trait;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContextHit {
    pub path: String,
    pub summary: String,
    pub score: f32,
}

#[async_trait]
pub trait ContextLookup: Send + Sync {
    async fn lookup_context(&self, query: &str, limit: usize) -> Vec<ContextHit>;
}

/// Default lookup for deployments without a retrieval store.
#[derive(Debug, Default)]
pub struct NoopContextLookup;

#[async_trait]
impl ContextLookup for NoopContextLookup {
    async fn lookup_context(&self, _query: &str, _limit: usize) -> Vec<ContextHit> {
        Vec::new()
    }
}
