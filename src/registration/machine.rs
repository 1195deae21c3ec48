/// A stable, MD5-derived identifier for the local machine, used for
/// development-mode isolation.
///
/// Hashing, not the raw hostname, keeps the Registry key length bounded and
/// avoids leaking the literal hostname into a shared namespace.
pub fn local_machine_id() -> String {
    let raw = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let digest = md5::compute(raw.as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_stable_for_the_same_input() {
        let digest_a = md5::compute(b"host-a");
        let digest_b = md5::compute(b"host-a");
        assert_eq!(format!("{digest_a:x}"), format!("{digest_b:x}"));
    }

    #[test]
    fn local_machine_id_is_a_32_char_hex_string() {
        let id = local_machine_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
