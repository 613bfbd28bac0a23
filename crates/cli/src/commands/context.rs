//! `tidewire context`: Show context window usage for a draft.

use std::path::PathBuf;

use tidewire_core::backend::DEFAULT_CHAT_ID;

use super::{build_runtime, load_config};

pub async fn run(draft: String, history: Option<PathBuf>, compress: bool) -> anyhow::Result<()> {
    let config = load_config()?;
    let runtime = build_runtime(&config, DEFAULT_CHAT_ID, history.as_deref()).await?;
    let guard = runtime.guard();

    let budget = guard.refresh(true).await;
    let usage = guard.sync(DEFAULT_CHAT_ID, &draft, &[]).await;

    println!("  Model:          {}", runtime.model_id());
    println!("  Context window: {}", usage.context_window);
    println!(
        "  Used:           {} tokens ({}%), {} remaining",
        usage.used_tokens,
        usage.percent(),
        usage.remaining
    );
    println!("    baseline      {}", usage.baseline_tokens);
    println!("    history       {}", usage.history_tokens);
    println!("    draft         {}", usage.draft_tokens);
    println!("    attachments   {}", usage.attachment_tokens);
    println!(
        "  Budget:         system {} + overhead {} + reserve {} (limit {})",
        budget.system_prompt_tokens,
        budget.history_overhead_tokens,
        budget.reserve_tokens,
        budget.model_context_limit
    );
    if usage.overflowed() {
        println!("\n  ⚠️  The next request would overflow the context window.");
    }

    if compress {
        println!();
        match runtime.compress_now(DEFAULT_CHAT_ID, &draft).await {
            Ok(candidate) => {
                println!(
                    "  Compression ({}): {} → {} messages, ~{} tokens saved",
                    candidate.strategy,
                    candidate.source_messages,
                    candidate.target_messages,
                    candidate.saved_tokens
                );
                println!(
                    "  After:          {} tokens ({}%){}",
                    candidate.usage.used_tokens,
                    candidate.usage.percent(),
                    if candidate.resolved_overflow { "" } else { ", still overflowing" }
                );
            }
            Err(e) => println!("  {e}"),
        }
    }

    Ok(())
}
