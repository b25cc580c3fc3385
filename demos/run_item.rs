//! Run one task item through the pipeline
//!
//! Usage: `cargo run --example run_item -- [task] [item.json] [config.yaml]`

use mpllm::prelude::*;
use mpllm::TraceAnnotation;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn sample_item(task: TaskType) -> TaskItem {
    match task {
        TaskType::Trivia => TaskItem::trivia(
            "Ancient Egypt",
            vec![
                "Which river runs through Egypt?".to_string(),
                "Who was the Egyptian sun god?".to_string(),
                "Where is the Great Pyramid?".to_string(),
            ],
        ),
        TaskType::Codenames => TaskItem::codenames(
            vec!["wave".into(), "ship".into()],
            ["wave", "ship", "car", "tree", "fish", "moon", "bank", "pilot"]
                .iter()
                .map(|w| w.to_string())
                .collect(),
        ),
        TaskType::Logic => TaskItem::logic(
            "Three friends, Alice, Bob and Carol, sit in a row. Bob is not at either end. \
             Alice sits to the left of Carol. Who sits on the far right?",
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let task: TaskType = args.next().as_deref().unwrap_or("recall-and-write").parse()?;
    let item = match args.next() {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => sample_item(task),
    };
    let config = match args.next() {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };

    println!("=== MPLLM: {} ===\n", task);

    let client = OpenRouterClient::from_env()?;
    let sequencer = Sequencer::from_config(&config, Arc::new(client))?;
    println!("✓ Arbiter {} / worker {}", config.arbiter_model, config.worker_model);

    let output = sequencer.run_task(task, &item).await?;

    println!("\n📤 Payload{}:", if output.degraded { " (degraded)" } else { "" });
    println!("{}", serde_json::to_string_pretty(&output.payload)?);

    println!("\n🔍 Stages:");
    for record in output.trace.records() {
        println!("  - {} ({} tokens)", record.stage, record.tokens.total_tokens);
        for annotation in &record.annotations {
            if let TraceAnnotation::TransportFailure { message } = annotation {
                println!("      failed: {}", message);
            } else {
                println!("      {:?}", annotation);
            }
        }
    }

    let cost = output.cost.summary();
    println!("\n📊 Cost:");
    println!("  - Calls: {}", output.cost.calls);
    println!("  - Tokens: {}", output.cost.total_tokens());
    println!("  - USD: {:.6}", cost.cost_usd);

    Ok(())
}
