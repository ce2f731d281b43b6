use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use berth_core::AllocationRequest;
use berth_placement::{Allocation, AllocationError, Allocator, RunOptions, Trace};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;

pub fn allocate(
    request: &str,
    policy: Option<&str>,
    seed: Option<u64>,
    deadline_ms: Option<u64>,
    format: &str,
) -> anyhow::Result<()> {
    if !matches!(format, "text" | "json") {
        bail!("Unknown format '{format}'; expected text or json");
    }
    let request = load_request(Path::new(request))?;
    let defaults = super::policy::load(policy)?;

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let opts = RunOptions {
        deadline: deadline_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
        ..RunOptions::default()
    };

    let outcome = Allocator::new(defaults).allocate(&request, opts, &mut rng);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&to_json(&outcome))?),
        _ => print!("{}", format_outcome(&outcome)),
    }

    outcome?;
    Ok(())
}

fn load_request(path: &Path) -> anyhow::Result<AllocationRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse request {}", path.display()))
}

fn to_json(outcome: &Result<Allocation, AllocationError>) -> serde_json::Value {
    match outcome {
        Ok(allocation) => json!({
            "server": allocation.server.uuid,
            "hostname": allocation.server.hostname,
            "score": allocation.score,
            "trace": allocation.trace,
        }),
        Err(err) => json!({
            "error": err.to_string(),
            "trace": err.trace(),
        }),
    }
}

fn format_outcome(outcome: &Result<Allocation, AllocationError>) -> String {
    let trace = match outcome {
        Ok(allocation) => Some(&allocation.trace),
        Err(err) => err.trace(),
    };
    let mut out = trace.map(format_trace).unwrap_or_default();

    match outcome {
        Ok(allocation) => {
            let host = allocation.server.hostname.as_str().unwrap_or("-");
            out.push_str(&format!(
                "\n✓ Allocated {} ({host}) with score {:.2}\n",
                allocation.server.uuid, allocation.score
            ));
        }
        Err(err) => out.push_str(&format!("\n✗ {err}\n")),
    }
    out
}

/// One numbered line per step with the survivor count, followed by the
/// step's reasons indented beneath it.
pub fn format_trace(trace: &Trace) -> String {
    let mut out = String::new();
    for (i, entry) in trace.iter().enumerate() {
        out.push_str(&format!(
            "{:>2}. {} [{} remaining]\n",
            i + 1,
            entry.step,
            entry.remaining.len()
        ));
        for (key, reason) in entry.reasons.iter() {
            out.push_str(&format!("      {key}: {reason}\n"));
        }
    }
    out
}
