pub mod config;
pub mod model;
pub mod repo;
pub mod tracing;

#[cfg(test)]
test_r::enable!();

/// Display for values that may embed secrets. Implementations must redact
/// anything that must not end up in logs or `--dump-config` output.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
