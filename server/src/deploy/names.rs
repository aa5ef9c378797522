//! DNS-safe guest naming.

/// Fallback when sanitization leaves nothing usable.
const FALLBACK_NAME: &str = "student-vm";

/// Sanitize a class name into a DNS-safe label.
///
/// Lowercase, everything outside `[a-z0-9-]` becomes `-`, runs collapse,
/// edges are trimmed to alphanumerics and the result is capped at 63 chars.
pub fn sanitize_vm_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut last_dash = false;

    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            sanitized.push(c);
            last_dash = false;
        } else if !last_dash && !sanitized.is_empty() {
            sanitized.push('-');
            last_dash = true;
        }
    }

    let sanitized = sanitized.trim_matches('-');
    let mut sanitized: String = sanitized.chars().take(63).collect();
    // truncation may leave a trailing dash
    while sanitized.ends_with('-') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        sanitized
    }
}

/// The name of the i-th (zero-based) student VM of a class.
pub fn student_vm_name(class_name: &str, index: usize, vmid: u32) -> String {
    let base = sanitize_vm_name(class_name);
    let suffix = format!("-student-{}-{}", index + 1, vmid);

    // keep the full name within the 63 char DNS label limit
    let budget = 63usize.saturating_sub(suffix.len());
    let mut base: String = base.chars().take(budget).collect();
    while base.ends_with('-') {
        base.pop();
    }

    format!("{base}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_dns_safe(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 63
            && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !name.starts_with('-')
            && !name.ends_with('-')
    }

    #[test]
    fn test_sanitize_vm_name() {
        assert_eq!(sanitize_vm_name("Network Security 101"), "network-security-101");
        assert_eq!(sanitize_vm_name("CS___Lab!!"), "cs-lab");
        assert_eq!(sanitize_vm_name("--weird--"), "weird");
        assert_eq!(sanitize_vm_name("ÜbungsLab"), "bungslab");
        assert_eq!(sanitize_vm_name(""), "student-vm");
        assert_eq!(sanitize_vm_name("!!!"), "student-vm");

        let long = "a".repeat(100);
        let sanitized = sanitize_vm_name(&long);
        assert_eq!(sanitized.len(), 63);
        assert!(is_dns_safe(&sanitized));
    }

    #[test]
    fn test_student_vm_name() {
        assert_eq!(
            student_vm_name("Network Security", 0, 12300),
            "network-security-student-1-12300"
        );

        let long = "very long class name ".repeat(5);
        let name = student_vm_name(&long, 41, 99999);
        assert!(is_dns_safe(&name), "{name:?} not DNS safe");
        assert!(name.ends_with("-student-42-99999"));
    }
}
