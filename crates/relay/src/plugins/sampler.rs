//! `sampler`: persists per-request IR artifacts for debugging and test
//! corpus collection.
//!
//! Layout under the configured directory, keyed by the SHA-256 of the
//! initial request's binary encoding (identical requests dedupe):
//!
//!   <dir>/<hash>/request.ail      initial parsed request (binary)
//!   <dir>/<hash>/request.up.ail   upstream-prepared program (binary)
//!   <dir>/<hash>/response.ail     complete response (binary)
//!   <dir>/<hash>.txt              disassembly log, growing per phase
//!
//! Enabled by the `SAMPLER` environment variable (the directory path);
//! registered on the tail list so its Before hook observes the program
//! after every other before-plugin has run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use ail::Program;

use crate::context::RequestContext;
use crate::drivers::UpstreamMeta;
use crate::error::RelayError;
use crate::plugin::{AfterHook, BeforeHook, Plugin, RequestInit, StreamEndHook};
use crate::provider::Provider;

pub struct Sampler {
    dir: PathBuf,
    /// trace id → request hash, so the later phases land next to the
    /// right request.
    hashes: Mutex<HashMap<String, String>>,
}

impl Sampler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Sampler {
            dir: dir.into(),
            hashes: Mutex::new(HashMap::new()),
        }
    }

    fn hash_for(&self, trace_id: &str) -> Option<String> {
        self.hashes
            .lock()
            .expect("sampler hashes poisoned")
            .get(trace_id)
            .cloned()
    }

    fn append_disasm(&self, hash: &str, phase: &str, prog: &Program) {
        let path = self.dir.join(format!("{hash}.txt"));
        let mut section = String::new();
        if path.exists() {
            section.push_str("\n\n; --- --- ---\n\n");
        }
        section.push_str(&format!("; {phase}\n"));
        section.push_str(&prog.disasm());
        if let Err(e) = append_file(&path, section.as_bytes()) {
            error!(path = %path.display(), error = %e, "sampler disasm write failed");
        }
    }

    fn write_binary(&self, path: &Path, prog: &Program) -> bool {
        match prog.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    error!(path = %path.display(), error = %e, "sampler binary write failed");
                    return false;
                }
                true
            }
            Err(e) => {
                error!(error = %e, "sampler encode failed");
                false
            }
        }
    }

    fn write_response(&self, ctx: &RequestContext, prog: &Program) {
        let Some(hash) = self.hash_for(&ctx.trace_id) else {
            return;
        };
        self.hashes
            .lock()
            .expect("sampler hashes poisoned")
            .remove(&ctx.trace_id);

        let bin_path = self.dir.join(&hash).join("response.ail");
        if self.write_binary(&bin_path, prog) {
            self.append_disasm(&hash, "response", prog);
            debug!(hash = %hash, "sampler saved response");
        }
    }
}

fn append_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(data)
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

impl Plugin for Sampler {
    fn name(&self) -> &str {
        "sampler"
    }

    fn as_request_init(&self) -> Option<&dyn RequestInit> {
        Some(self)
    }

    fn as_before(&self) -> Option<&dyn BeforeHook> {
        Some(self)
    }

    fn as_after(&self) -> Option<&dyn AfterHook> {
        Some(self)
    }

    fn as_stream_end(&self) -> Option<&dyn StreamEndHook> {
        Some(self)
    }
}

impl RequestInit for Sampler {
    fn on_request_init(&self, ctx: &RequestContext, prog: &Program) {
        if ctx.trace_id.is_empty() {
            return;
        }
        let bytes = match prog.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "sampler encode failed for request");
                return;
            }
        };
        let hash = hex_digest(&bytes);
        self.hashes
            .lock()
            .expect("sampler hashes poisoned")
            .insert(ctx.trace_id.clone(), hash.clone());

        let details_dir = self.dir.join(&hash);
        if let Err(e) = std::fs::create_dir_all(&details_dir) {
            error!(dir = %details_dir.display(), error = %e, "sampler mkdir failed");
            return;
        }

        let bin_path = details_dir.join("request.ail");
        if bin_path.exists() {
            // Same request seen before; keep the existing artifacts.
            debug!(hash = %hash, "sampler duplicate request, skipping write");
            return;
        }
        if let Err(e) = std::fs::write(&bin_path, &bytes) {
            error!(path = %bin_path.display(), error = %e, "sampler request write failed");
            return;
        }
        self.append_disasm(&hash, "request", prog);
        debug!(hash = %hash, "sampler saved request");
    }
}

#[async_trait]
impl BeforeHook for Sampler {
    async fn before(
        &self,
        _params: &str,
        _provider: &Provider,
        ctx: &RequestContext,
        prog: Program,
    ) -> Result<Program, RelayError> {
        if let Some(hash) = self.hash_for(&ctx.trace_id) {
            let bin_path = self.dir.join(&hash).join("request.up.ail");
            if self.write_binary(&bin_path, &prog) {
                self.append_disasm(&hash, "upstream request", &prog);
                debug!(hash = %hash, "sampler saved upstream request");
            }
        }
        Ok(prog)
    }
}

#[async_trait]
impl AfterHook for Sampler {
    async fn after(
        &self,
        _params: &str,
        _provider: &Provider,
        ctx: &RequestContext,
        _req_prog: &Program,
        _upstream: &UpstreamMeta,
        res_prog: Program,
    ) -> Result<Program, RelayError> {
        self.write_response(ctx, &res_prog);
        Ok(res_prog)
    }
}

#[async_trait]
impl StreamEndHook for Sampler {
    async fn stream_end(
        &self,
        _params: &str,
        _provider: &Provider,
        ctx: &RequestContext,
        _req_prog: &Program,
        _upstream: &UpstreamMeta,
        assembled: &Program,
    ) -> Result<(), RelayError> {
        self.write_response(ctx, assembled);
        Ok(())
    }
}
