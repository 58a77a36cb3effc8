//! INFO sections.

use std::fmt::Write;

use crate::replication::Role;
use crate::state::ServerState;

pub const SECTIONS: &[&str] = &["server", "replication"];

pub fn is_section(name: &str) -> bool {
    SECTIONS.iter().any(|section| section.eq_ignore_ascii_case(name))
}

/// Renders the named sections, or all of them when `sections` is empty.
/// Callers validate names with [`is_section`] first.
pub fn render(state: &ServerState, sections: &[String]) -> String {
    let wanted: Vec<&str> = if sections.is_empty() {
        SECTIONS.to_vec()
    } else {
        sections.iter().map(String::as_str).collect()
    };

    wanted
        .iter()
        .filter_map(|name| match name.to_ascii_lowercase().as_str() {
            "server" => Some(server(state)),
            "replication" => Some(replication(state)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

fn server(state: &ServerState) -> String {
    let mut out = String::from("# Server\r\n");
    let _ = write!(out, "redis_version:7.2.0\r\n");
    let _ = write!(out, "server_name:{}\r\n", env!("CARGO_PKG_NAME"));
    let _ = write!(out, "server_version:{}\r\n", env!("CARGO_PKG_VERSION"));
    if let Some(port) = state.config.get("port") {
        let _ = write!(out, "tcp_port:{port}\r\n");
    }
    out
}

fn replication(state: &ServerState) -> String {
    let replication = &state.replication;
    let mut out = String::from("# Replication\r\n");

    let _ = write!(out, "role:{}\r\n", replication.role());

    match replication.role() {
        Role::Master => {
            let replicas = replication.replicas();
            let _ = write!(out, "connected_slaves:{}\r\n", replicas.len());
            for (n, (_, addr, acked)) in replicas.iter().enumerate() {
                let (ip, port) = addr.map_or(("?".to_string(), 0), |addr| (addr.ip().to_string(), addr.port()));
                let _ = write!(out, "slave{n}:ip={ip},port={port},state=online,offset={acked}\r\n");
            }
            let _ = write!(out, "master_replid:{}\r\n", replication.replid());
            let _ = write!(out, "master_repl_offset:{}\r\n", replication.offset());
        }
        Role::Replica { host, port } => {
            let _ = write!(out, "master_host:{host}\r\n");
            let _ = write!(out, "master_port:{port}\r\n");
            let _ = write!(out, "slave_repl_offset:{}\r\n", replication.replica_offset());
            let _ = write!(out, "connected_slaves:0\r\n");
            let _ = write!(out, "master_replid:{}\r\n", replication.replid());
            let _ = write!(out, "master_repl_offset:{}\r\n", replication.replica_offset());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn master_replication_section() {
        let state = ServerState::new(Config::new(), Role::Master);
        let text = render(&state, &["replication".to_string()]);

        assert!(text.starts_with("# Replication\r\n"));
        assert!(text.contains("role:master\r\n"));
        assert!(text.contains("connected_slaves:0\r\n"));
        assert!(text.contains("master_repl_offset:0\r\n"));
        assert!(!text.contains("# Server"));
    }

    #[test]
    fn replica_reports_its_master() {
        let role = Role::Replica {
            host: "localhost".to_string(),
            port: 6379,
        };
        let state = ServerState::new(Config::new(), role);
        let text = render(&state, &[]);

        assert!(text.contains("# Server\r\n"));
        assert!(text.contains("role:slave\r\n"));
        assert!(text.contains("master_port:6379\r\n"));
    }

    #[test]
    fn section_names_are_case_insensitive() {
        assert!(is_section("Replication"));
        assert!(!is_section("keyspace"));
    }
}
