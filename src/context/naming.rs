//! Fully qualified names and strategy postfixes derived from levels.

use crate::context::level::Level;

const PARALLEL_IDENTIFIER: &str = "parallel";
/// Matrix value key holding the de-duplication suffix, never part of the value list
const DUPLICATE_POSTFIX_KEY: &str = "matrixIdentifierPostfixForDuplicates";

/// Dot-joined identifiers of every level that takes part in expressions.
///
/// Levels flagged `skip_expression_chain` (strategy wrappers) and the synthetic
/// `parallel` fork are left out.
pub fn fqn_from_levels(levels: &[Level]) -> String {
    levels
        .iter()
        .filter(|l| !l.skip_expression_chain && l.identifier != PARALLEL_IDENTIFIER)
        .map(|l| l.identifier.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

/// Identifier suffix of a strategy iteration, e.g. `_0` or `_linux_amd64_0`.
///
/// With `use_matrix_values` the node name (if given) or the matrix values in
/// key order are used; otherwise the combination indices. The duplicate
/// postfix is always appended last. Levels outside a strategy get `""`.
pub fn strategy_postfix(level: &Level, use_matrix_values: bool) -> String {
    let Some(strategy) = &level.strategy else {
        return String::new();
    };
    let Some(matrix) = &strategy.matrix else {
        return format!("_{}", strategy.current_iteration);
    };

    let mut parts: Vec<String> = if use_matrix_values {
        match &matrix.node_name {
            Some(name) if !name.is_empty() => vec![name.clone()],
            _ => matrix
                .matrix_values
                .iter()
                .filter(|(key, _)| key.as_str() != DUPLICATE_POSTFIX_KEY)
                .map(|(_, value)| value.clone())
                .collect(),
        }
    } else {
        matrix
            .matrix_combination
            .iter()
            .map(u32::to_string)
            .collect()
    };

    if let Some(duplicate) = matrix.matrix_values.get(DUPLICATE_POSTFIX_KEY) {
        parts.push(duplicate.clone());
    }

    parts
        .iter()
        .map(|p| format!("_{p}"))
        .collect::<String>()
}
