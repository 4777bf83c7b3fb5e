//! Completion checks on a CUDA driver stream.
//!
//! Lets [`check_completion`](crate::check_completion) run against a real
//! device stream when the engine drives its own CUDA work alongside PME.

use std::sync::Arc;

use anyhow::Result;
use cudarc::driver::CudaStream;
use pme_core::PmeError;

use crate::monitor::CompletionStream;

impl CompletionStream for Arc<CudaStream> {
    fn supports_query(&self) -> bool {
        true
    }

    fn query(&self) -> Result<bool> {
        let event = self
            .record_event(None)
            .map_err(|e| PmeError::gpu("stream query", e.to_string()))?;
        Ok(event.is_complete())
    }

    fn synchronize(&self) -> Result<()> {
        CudaStream::synchronize(self).map_err(|e| PmeError::gpu("stream synchronize", e.to_string()))?;
        Ok(())
    }
}
