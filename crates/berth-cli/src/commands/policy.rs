use std::path::Path;

use anyhow::Context;
use berth_core::PolicyDefaults;
use berth_placement::Allocator;

/// Load a policy file, or the built-in defaults when none is given.
pub fn load(path: Option<&str>) -> anyhow::Result<PolicyDefaults> {
    match path {
        Some(path) => PolicyDefaults::from_file(Path::new(path))
            .with_context(|| format!("Failed to load policy {path}")),
        None => Ok(PolicyDefaults::default()),
    }
}

pub fn show(path: Option<&str>) -> anyhow::Result<()> {
    let defaults = load(path)?;
    print!("{}", defaults.to_toml_string()?);
    Ok(())
}

pub fn steps() -> anyhow::Result<()> {
    print!("{}", format_steps(&Allocator::new(PolicyDefaults::default())));
    Ok(())
}

fn format_steps(allocator: &Allocator) -> String {
    allocator
        .step_names()
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{:>2}. {name}\n", i + 1))
        .collect()
}
