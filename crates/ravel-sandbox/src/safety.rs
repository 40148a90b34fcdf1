//! Static safety check run before any sandboxed evaluation.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{SandboxError, SandboxResult};

/// Upper bound on accepted source size.
pub const MAX_CODE_BYTES: usize = 64 * 1024;

fn disallowed() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"\beval\s*\(", "dynamic evaluation via eval() is not allowed"),
            (r"\bimport\s+", "module imports are not allowed"),
            (r"\bexport\s+", "module exports are not allowed"),
            (r"\bFn\s*\(", "dynamic function pointers via Fn() are not allowed"),
            (r"\bcall_fn\b", "dynamic function invocation is not allowed"),
            (r"\bcurry\s*\(", "function currying is not allowed"),
        ]
        .iter()
        .filter_map(|(pattern, reason)| Regex::new(pattern).ok().map(|re| (re, *reason)))
        .collect()
    })
}

/// Reject code containing constructs that could escape the capability scope.
pub fn validate_code(code: &str) -> SandboxResult<()> {
    if code.trim().is_empty() {
        return Err(SandboxError::UnsafeCode {
            reason: "code is empty".to_string(),
        });
    }
    if code.len() > MAX_CODE_BYTES {
        return Err(SandboxError::UnsafeCode {
            reason: format!(
                "code is {} bytes, exceeding the {} byte limit",
                code.len(),
                MAX_CODE_BYTES
            ),
        });
    }
    if code.contains('\0') {
        return Err(SandboxError::UnsafeCode {
            reason: "code contains NUL bytes".to_string(),
        });
    }
    for (re, reason) in disallowed() {
        if re.is_match(code) {
            return Err(SandboxError::UnsafeCode {
                reason: (*reason).to_string(),
            });
        }
    }
    Ok(())
}
