//! Context compaction for phase inputs.
//!
//! Downstream phases never see raw upstream outputs. The compactor renders
//! dependency outputs into a budgeted text context: headline fields of every
//! dependency always make it in; detail fields are added in graph-proximity
//! order (closest dependency first) while the token budget allows. If even
//! the headlines overflow the budget, the farthest dependency's headline
//! lines are truncated.

use serde_json::Value;

use crate::phases::PhaseSpec;

/// chars/4 ceiling heuristic. Deliberately conservative; exact counts come
/// back from the model and feed the ledger.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// One upstream output feeding the phase being compacted for. `distance` is
/// the BFS dependency distance from that phase (1 = direct dependency).
pub struct DependencyOutput<'a> {
    pub spec: &'a PhaseSpec,
    pub output: &'a Value,
    pub distance: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactedContext {
    pub text: String,
    pub estimated_tokens: u64,
    /// True when anything was left out: skipped detail fields or truncated
    /// headline lines.
    pub truncated: bool,
}

fn render_field(output: &Value, field: &str) -> Option<String> {
    let value = output.get(field)?;
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(format!("{}: {}", field, rendered))
}

fn render_fields(spec: &PhaseSpec, output: &Value, fields: &[&str]) -> String {
    let mut lines = vec![format!("## {}", spec.name)];
    for field in fields {
        if let Some(line) = render_field(output, field) {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Compact dependency outputs into a context of at most `budget_tokens`
/// (estimated). Callers pass dependencies in any order; compaction sorts by
/// proximity internally.
pub fn compact(deps: &[DependencyOutput<'_>], budget_tokens: u64) -> CompactedContext {
    let mut ordered: Vec<&DependencyOutput<'_>> = deps.iter().collect();
    ordered.sort_by_key(|dep| dep.distance);

    let mut headline_blocks: Vec<String> = ordered
        .iter()
        .map(|dep| render_fields(dep.spec, dep.output, dep.spec.headline_fields))
        .collect();

    let mut truncated = false;
    let headline_total: u64 = headline_blocks.iter().map(|b| estimate_tokens(b)).sum();

    if headline_total > budget_tokens {
        // Shed headline lines from the farthest dependency inward until the
        // context fits. Section headers go last.
        truncated = true;
        let mut total = headline_total;
        for block in headline_blocks.iter_mut().rev() {
            while total > budget_tokens {
                let Some((rest, last)) = block.rsplit_once('\n') else {
                    break;
                };
                total -= estimate_tokens(last);
                *block = rest.to_string();
            }
            if total <= budget_tokens {
                break;
            }
        }
        let text = headline_blocks.join("\n\n");
        let estimated_tokens = estimate_tokens(&text);
        return CompactedContext {
            text,
            estimated_tokens,
            truncated,
        };
    }

    // Headlines fit; spend the remaining budget on detail blocks, closest
    // dependency first.
    let mut blocks = headline_blocks;
    let mut total = headline_total;
    for (i, dep) in ordered.iter().enumerate() {
        if dep.spec.detail_fields.is_empty() {
            continue;
        }
        let detail = render_fields(dep.spec, dep.output, dep.spec.detail_fields);
        let cost = estimate_tokens(&detail);
        if total + cost <= budget_tokens {
            // Merge into that dependency's section, dropping the repeated
            // header line.
            let body = detail.splitn(2, '\n').nth(1).unwrap_or("").to_string();
            if !body.is_empty() {
                blocks[i] = format!("{}\n{}", blocks[i], body);
                total += cost;
            }
        } else {
            truncated = true;
        }
    }

    let text = blocks.join("\n\n");
    let estimated_tokens = estimate_tokens(&text);
    CompactedContext {
        text,
        estimated_tokens,
        truncated,
    }
}
