//! Listening TCP port discovery for status snapshots.

/// TCP state code for LISTEN in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

/// Parse a `/proc/net/tcp` or `/proc/net/tcp6` table and return the local
/// ports of sockets in LISTEN state.
pub fn parse_proc_net_tcp(table: &str) -> Vec<u16> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let state = fields.nth(1)?;
            if state != TCP_LISTEN {
                return None;
            }
            let (_, port) = local.rsplit_once(':')?;
            u16::from_str_radix(port, 16).ok()
        })
        .collect()
}

/// Ports currently listening on this host, sorted and deduplicated, minus
/// `ignored`. Empty where `/proc/net` is unavailable.
pub async fn listening_ports(ignored: &[u16]) -> Vec<u16> {
    let mut ports = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match tokio::fs::read_to_string(table).await {
            Ok(contents) => ports.extend(parse_proc_net_tcp(&contents)),
            Err(e) => tracing::trace!(table, error = %e, "port table unavailable"),
        }
    }
    ports.sort_unstable();
    ports.dedup();
    ports.retain(|p| !ignored.contains(p));
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1AE1 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 1 1 0000000000000000 100 0 0 10 0
   1: 00000000:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 2 1 0000000000000000 100 0 0 10 0
   2: 0100007F:1AE1 0100007F:D2F0 01 00000000:00000000 00:00000000 00000000  1000        0 3 1 0000000000000000 20 4 30 10 -1
";

    const TCP6: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0BB8 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 4 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn only_listening_sockets_are_reported() {
        assert_eq!(parse_proc_net_tcp(TCP), vec![6881, 3000]);
    }

    #[test]
    fn ipv6_table_parses() {
        assert_eq!(parse_proc_net_tcp(TCP6), vec![3000]);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        assert!(parse_proc_net_tcp("header\nnot a row\n   0: zz:zz 0:0 0A").is_empty());
        assert!(parse_proc_net_tcp("").is_empty());
    }

    #[tokio::test]
    async fn ignored_ports_are_removed() {
        let mut all = listening_ports(&[]).await;
        if let Some(first) = all.first().copied() {
            let filtered = listening_ports(&[first]).await;
            assert!(!filtered.contains(&first));
        }
        all.dedup();
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }
}
