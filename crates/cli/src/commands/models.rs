//! `tidewire models`: Inspect and select backend models.

use tidewire_backend::fallback;
use tidewire_core::{Backend, ModelCatalog};

use super::{connect, load_config};

pub async fn run(select: Option<String>, show_plan: bool) -> anyhow::Result<()> {
    let config = load_config()?;
    let backend = connect(&config)?;

    if let Some(model_id) = select {
        backend.select_model(&model_id, true).await?;
        println!("  Selected {model_id}");
    }

    let catalog = backend.list_models().await?;
    print_catalog(&catalog);

    if show_plan {
        let Some(current) = catalog.selected_id() else {
            println!("\n  No model selected; nothing to plan.");
            return Ok(());
        };
        let plan = fallback::plan(&catalog, current, config.fallback.profile());
        println!();
        println!("  Fallback plan for {current} ({}):", plan.profile);
        if plan.is_empty() {
            println!("    (no candidates)");
        }
        for (i, candidate) in plan.candidates.iter().enumerate() {
            println!(
                "    {}. {:<24} score {:>5.1}{}{}",
                i + 1,
                candidate.id,
                candidate.score,
                if candidate.loaded { "  loaded" } else { "" },
                if candidate.cached { "  cached" } else { "" },
            );
        }
    }

    Ok(())
}

fn print_catalog(catalog: &ModelCatalog) {
    if catalog.models.is_empty() {
        println!("  The backend reports no models.");
        return;
    }
    let selected = catalog.selected_id();
    println!("  {:<2} {:<28} {:>6}  flags", "", "model", "size");
    for model in &catalog.models {
        let marker = if selected == Some(model.id.as_str()) { "*" } else { " " };
        let mut flags = Vec::new();
        if catalog.is_loaded(&model.id) {
            flags.push("loaded");
        }
        if model.cache.cached {
            flags.push("cached");
        }
        if model.supports_tools {
            flags.push("tools");
        }
        if !model.compatibility.compatible {
            flags.push("incompatible");
        }
        println!(
            "  {marker:<2} {:<28} {:>6}  {}",
            model.id,
            model.size,
            flags.join(", ")
        );
    }
}
