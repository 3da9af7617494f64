//! Parser for the kernel's cpulist/nodelist format (`0-3,8,10-11`).

use anyhow::{bail, Context, Result};

/// Expand a cpulist into individual ids, ascending and deduplicated.
pub fn parse(list: &str) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for part in list.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((low, high)) => {
                let low = parse_id(low, part)?;
                let high = parse_id(high, part)?;
                if low > high {
                    bail!("inverted range '{part}'");
                }
                ids.extend(low..=high);
            }
            None => ids.push(parse_id(part, part)?),
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

fn parse_id(s: &str, part: &str) -> Result<u32> {
    s.trim()
        .parse()
        .with_context(|| format!("invalid id '{s}' in '{part}'"))
}
