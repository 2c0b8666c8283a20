//! Canonical metric key handling.

/// Prefix of interface-scoped wire keys.
const IFACE_PREFIX: &str = "iface.";

/// Split a wire key into `(base_key, interface_name)`.
///
/// Interface metrics travel as `iface.<name>.<field>` and are stored as
/// `iface.<field>` plus the interface name. The field is taken after the last
/// dot so VLAN-style names (`ether1.100`) stay intact. Anything else is
/// device-level and returned unchanged.
///
/// ```
/// use routerwatch::metric::split_key;
///
/// assert_eq!(split_key("iface.ether1.rx_bps"), ("iface.rx_bps".to_string(), Some("ether1".to_string())));
/// assert_eq!(split_key("system.cpu.load_pct"), ("system.cpu.load_pct".to_string(), None));
/// ```
pub fn split_key(wire_key: &str) -> (String, Option<String>) {
    if let Some(rest) = wire_key.strip_prefix(IFACE_PREFIX)
        && let Some((name, field)) = rest.rsplit_once('.')
        && !name.is_empty()
        && !field.is_empty()
    {
        return (format!("{IFACE_PREFIX}{field}"), Some(name.to_string()));
    }
    (wire_key.to_string(), None)
}

/// Build the wire key for an interface-scoped field.
pub fn interface_key(interface: &str, field: &str) -> String {
    format!("{IFACE_PREFIX}{interface}.{field}")
}

/// Key of the derived rate for a counter metric.
///
/// `iface.rx_bytes_total` becomes `iface.rx_bytes_per_sec`; keys without a
/// `_total` suffix get `_per_sec` appended.
pub fn rate_key(counter_key: &str) -> String {
    match counter_key.strip_suffix("_total") {
        Some(stem) => format!("{stem}_per_sec"),
        None => format!("{counter_key}_per_sec"),
    }
}

/// Derive a display name from a key: `system.cpu.load_pct` -> `System Cpu Load Pct`.
pub fn humanize_key(key: &str) -> String {
    key.split(['.', '_'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
