//! Node-ID codec for the fleet control plane.
//!
//! A node-id is the canonical string a discovery stream is addressed by:
//! `name::project` or `name::project::downstream_address`. `name` is the
//! listener's name, `project` is the tenant scope, and `downstream_address`
//! is present only for "managed" listeners where several agents share one
//! listener but each binds a distinct downstream socket.
//!
//! These are pure functions: no I/O, no allocation beyond the returned
//! `String`/tuple, and no panics on malformed input — malformed input
//! decodes to empty components rather than erroring.
//!
//! # Example
//!
//! ```
//! use fleetd_nodeid::{decode, encode};
//!
//! let id = encode("L1", "P1", None);
//! assert_eq!(id, "L1::P1");
//! assert_eq!(decode(&id), ("L1".to_string(), "P1".to_string(), None));
//!
//! let managed = encode("L1", "P1", Some("10.0.0.1:443"));
//! assert_eq!(managed, "L1::P1::10.0.0.1:443");
//! ```

const SEPARATOR: &str = "::";

/// Encodes a `(name, project, downstream_address?)` triple into its
/// canonical node-id string.
///
/// Callers are responsible for ensuring `name`, `project`, and `addr` do
/// not themselves contain `::` — the codec does not escape it.
#[must_use]
pub fn encode(name: &str, project: &str, addr: Option<&str>) -> String {
    match addr {
        Some(addr) => format!("{name}{SEPARATOR}{project}{SEPARATOR}{addr}"),
        None => format!("{name}{SEPARATOR}{project}"),
    }
}

/// Decodes a node-id string into `(name, project, downstream_address?)`.
///
/// Returns empty strings (and `None` for the address) when `s` does not
/// split into exactly two or three `::`-separated parts.
#[must_use]
pub fn decode(s: &str) -> (String, String, Option<String>) {
    let parts: Vec<&str> = s.split(SEPARATOR).collect();
    match parts.as_slice() {
        [name, project] => (name.to_string(), project.to_string(), None),
        [name, project, addr] => (name.to_string(), project.to_string(), Some(addr.to_string())),
        _ => (String::new(), String::new(), None),
    }
}

/// Returns `true` if `s` is an unmanaged node-id (no downstream address).
#[must_use]
pub fn is_unmanaged(s: &str) -> bool {
    let (name, project, addr) = decode(s);
    !name.is_empty() && !project.is_empty() && addr.is_none()
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::{decode, encode, is_unmanaged};

    #[test_case("L1", "P1", None; "unmanaged")]
    #[test_case("L1", "P1", Some("10.0.0.1:443"); "managed")]
    fn roundtrip(name: &str, project: &str, addr: Option<&str>) {
        let encoded = encode(name, project, addr);
        let decoded = decode(&encoded);
        assert_eq!(decoded, (name.to_string(), project.to_string(), addr.map(str::to_string)));
    }

    #[test]
    fn decode_rejects_wrong_separator_count() {
        assert_eq!(decode("just-one-part"), (String::new(), String::new(), None));
        assert_eq!(decode("a::b::c::d"), (String::new(), String::new(), None));
        assert_eq!(decode(""), (String::new(), String::new(), None));
    }

    #[test]
    fn unmanaged_detection() {
        assert!(is_unmanaged("L1::P1"));
        assert!(!is_unmanaged("L1::P1::10.0.0.1:443"));
        assert!(!is_unmanaged("malformed"));
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_prop(
            name in "[a-zA-Z0-9_-]{1,16}",
            project in "[a-zA-Z0-9_-]{1,16}",
            has_addr in proptest::bool::ANY,
            addr in "[a-zA-Z0-9_.:-]{1,16}",
        ) {
            let addr_opt = if has_addr { Some(addr.as_str()) } else { None };
            let encoded = encode(&name, &project, addr_opt);
            let (d_name, d_project, d_addr) = decode(&encoded);
            prop_assert_eq!(d_name, name);
            prop_assert_eq!(d_project, project);
            prop_assert_eq!(d_addr, addr_opt.map(str::to_string));
        }
    }
}
