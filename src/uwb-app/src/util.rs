// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

/// Normalize a hardware address to upper-case colon-separated form.
///
/// Accepts `:` or `-` separators, or twelve bare hex digits. Returns `None`
/// for anything that is not a 48-bit address.
pub fn normalize_mac(address: &str) -> Option<String> {
    let digits: String = address
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .collect();
    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let upper = digits.to_ascii_uppercase();
    let octets: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
    Some(octets.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("c4:1a:22:33:44:5f").as_deref(),
            Some("C4:1A:22:33:44:5F")
        );
        assert_eq!(
            normalize_mac("C4-1A-22-33-44-5F").as_deref(),
            Some("C4:1A:22:33:44:5F")
        );
        assert_eq!(
            normalize_mac(" c41a2233445f ").as_deref(),
            Some("C4:1A:22:33:44:5F")
        );
    }

    #[test]
    fn test_normalize_mac_rejects_garbage() {
        assert_eq!(normalize_mac(""), None);
        assert_eq!(normalize_mac("C4:1A:22:33:44"), None);
        assert_eq!(normalize_mac("G4:1A:22:33:44:5F"), None);
    }
}
