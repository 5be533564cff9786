use shared::protocol::{BACKEND_PREFIX, FRONTEND_PREFIX, SERVER_PREFIX};
use shared::types::{canonicalize, ServiceRegistrations};
use crate::haproxy::HaproxyConfig;

const GLOBAL_OPTIONS: &[&str] = &[
    // "log global" stays off: haproxy runs without a syslog target here
    "quiet",
];

const DEFAULTS_OPTIONS: &[&str] = &[
    "mode tcp",
    "timeout connect 5000ms",
    "timeout client 50000ms",
    "timeout server 50000ms",
];

pub fn backend_name(service_port: u16) -> String {
    format!("{}-{}", BACKEND_PREFIX, service_port)
}

/// Create haproxy configuration content for a snapshot.
///
/// The snapshot is canonicalized first, so the output depends only on which
/// instances are registered and never on read order.
pub fn render_config(services: &ServiceRegistrations) -> String {
    let services = canonicalize(services.clone());

    let mut c = HaproxyConfig::new();
    c.section("global").add(GLOBAL_OPTIONS.iter().copied());
    c.section("defaults").add(DEFAULTS_OPTIONS.iter().copied());

    // Frontend for each service port
    for sr in &services {
        c.section(format!("frontend {}-{}", FRONTEND_PREFIX, sr.service_port))
            .add_one(format!("bind *:{}", sr.service_port))
            .add_one(format!("default_backend {}", backend_name(sr.service_port)));
    }

    // Backends
    for sr in &services {
        let section = c.section(format!("backend {}", backend_name(sr.service_port)));
        section.add(["balance roundrobin", "mode tcp"]);

        for (i, instance) in sr.instances.iter().enumerate() {
            let id = format!("{}-{}-{}", SERVER_PREFIX, sr.service_port, i);
            section.add_one(format!("server {} {}", id, instance));
        }
    }

    c.render()
}
