use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::UpscaleResult;
use crate::scheduler::{BatchParams, ProgressCallback, Scheduler};
use crate::types::EnhancedTile;

pub const MAX_PASSES: u32 = 4;

const PASS_PROMPTS: [&str; 3] = [
    "refine micro-texture and fine detail",
    "final detail polish",
    "subtle consistency pass",
];

/// Clamp a requested pass count to `1..=MAX_PASSES`.
pub fn clamp_passes(requested: u32) -> u32 {
    requested.clamp(1, MAX_PASSES)
}

/// Prompt used for refinement pass `pass` (2-based), prefixed by the
/// caller's own prompt when one is given.
pub fn pass_prompt(base_prompt: &str, pass: u32) -> String {
    let index = (pass.saturating_sub(2) as usize).min(PASS_PROMPTS.len() - 1);
    let base = base_prompt.trim();
    if base.is_empty() {
        PASS_PROMPTS[index].to_string()
    } else {
        format!("{base}; {}", PASS_PROMPTS[index])
    }
}

/// Run passes `2..=passes` over already-enhanced tiles at scale 1.
///
/// Tiles are never re-merged between passes; each pass feeds the previous
/// pass's buffers straight back through the scheduler. `progress` receives
/// `(completed, total)` counted across all refinement passes.
pub async fn refine(
    scheduler: &Scheduler,
    tiles: Vec<EnhancedTile>,
    passes: u32,
    base: &BatchParams,
    progress: Option<ProgressCallback>,
) -> UpscaleResult<Vec<EnhancedTile>> {
    let passes = clamp_passes(passes);
    if passes <= 1 || tiles.is_empty() {
        return Ok(tiles);
    }

    let per_pass = tiles.len();
    let total = per_pass * (passes as usize - 1);
    let mut current = tiles;

    for pass in 2..=passes {
        let offset = per_pass * (pass as usize - 2);
        let pass_progress = progress.as_ref().map(|callback| {
            let callback = Arc::clone(callback);
            Arc::new(move |done: usize, _: usize| callback(offset + done, total)) as ProgressCallback
        });

        let params = BatchParams {
            prompt: pass_prompt(&base.prompt, pass),
            scale: 1.0,
            pass,
            ..base.clone()
        };
        debug!(pass, prompt = %params.prompt, "Starting refinement pass");

        let started = Instant::now();
        let inputs = current.into_iter().map(EnhancedTile::into_tile).collect();
        current = scheduler.enhance_all(inputs, &params, pass_progress).await?;
        info!(
            pass,
            of = passes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Refinement pass complete"
        );
    }

    Ok(current)
}
