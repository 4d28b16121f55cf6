//! The scripting extension boundary (§1: "specified only as an opaque
//! handle with `new/kill/callMethod`"). No scripting engine is implemented;
//! this module keeps the `ext` binary command and the HTTP `X-TT-XNAME`
//! path reachable against a stub that behaves the way the original does
//! when `-ext` is omitted — every call fails with `invalid-operation`
//! rather than the command simply not existing (SPEC_FULL §5).

use async_trait::async_trait;
use bytes::Bytes;

/// A per-thread scripted method callback host. Real implementations would
/// load a scripting library (Lua, etc.) at the configured `-ext` path and
/// dispatch named methods into it; this crate only models the boundary.
#[async_trait]
pub trait ScriptExtension: Send + Sync {
    /// Calls `name(key, args)`, returning its result bytes, or `None` if
    /// the extension has no such method or none is loaded at all.
    async fn call_method(&self, name: &str, key: &[u8], args: &[Bytes]) -> Option<Vec<u8>>;
}

/// The stub used whenever no `-ext` library is configured. Mirrors
/// `scrextnew`'s behavior in the original: constructible, but every call
/// fails.
pub struct NullExtension;

#[async_trait]
impl ScriptExtension for NullExtension {
    async fn call_method(&self, _name: &str, _key: &[u8], _args: &[Bytes]) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_extension_refuses_every_call() {
        let ext = NullExtension;
        assert!(ext.call_method("anything", b"k", &[]).await.is_none());
    }
}
