//! Systemd units and firewall posture per node role
//!
//! Masters run the etcd server and publish the overlay network config.
//! Nodes run an etcd proxy, the overlay client and the container runtime.
//! Edges are nodes that also terminate ingress traffic on 80/443.

use crate::config::NodeRole;

/// One systemd unit as it appears in the `coreos.units` list
pub(crate) struct UnitTemplate {
    pub name: &'static str,
    pub command: Option<&'static str>,
    pub enable: bool,
    /// Full unit body; `None` for units shipped with the OS
    pub content: Option<&'static str>,
    pub drop_ins: &'static [(&'static str, &'static str)],
}

const ETCD2: UnitTemplate = UnitTemplate {
    name: "etcd2.service",
    command: Some("start"),
    enable: false,
    content: None,
    drop_ins: &[],
};

const FLEET: UnitTemplate = UnitTemplate {
    name: "fleet.service",
    command: Some("start"),
    enable: false,
    content: None,
    drop_ins: &[],
};

const FLANNEL_MASTER: UnitTemplate = UnitTemplate {
    name: "flanneld.service",
    command: Some("start"),
    enable: false,
    content: None,
    drop_ins: &[(
        "50-network-config.conf",
        "[Unit]
Requires=etcd2.service
After=etcd2.service

[Service]
ExecStartPre=/usr/bin/etcdctl set /coreos.com/network/config '{{ network_json }}'
",
    )],
};

const FLANNEL: UnitTemplate = UnitTemplate {
    name: "flanneld.service",
    command: Some("start"),
    enable: false,
    content: None,
    drop_ins: &[(
        "50-etcd-proxy.conf",
        "[Unit]
Requires=etcd2.service
After=etcd2.service
",
    )],
};

const DOCKER: UnitTemplate = UnitTemplate {
    name: "docker.service",
    command: Some("start"),
    enable: false,
    content: None,
    drop_ins: &[(
        "40-flannel.conf",
        "[Unit]
Requires=flanneld.service
After=flanneld.service
",
    )],
};

const DNS_REGISTER: UnitTemplate = UnitTemplate {
    name: "ns1dns.service",
    command: Some("start"),
    enable: true,
    content: Some(
        "[Unit]
Description=Register {{ hostname }} in DNS
After=network-online.target
Requires=network-online.target

[Service]
Type=oneshot
RemainAfterExit=yes
EnvironmentFile=/etc/kato/ns1dns.env
ExecStart=/usr/bin/docker run --rm --env-file /etc/kato/ns1dns.env katosys/ns1dns:v0.1.0 --zone {{ domain }} --record {{ short_name }} --ip $private_ipv4

[Install]
WantedBy=multi-user.target
",
    ),
    drop_ins: &[],
};

const FIREWALL: UnitTemplate = UnitTemplate {
    name: "iptables-restore.service",
    command: Some("start"),
    enable: true,
    content: None,
    drop_ins: &[],
};

const INGRESS: UnitTemplate = UnitTemplate {
    name: "haproxy.service",
    command: Some("start"),
    enable: true,
    content: Some(
        "[Unit]
Description=Ingress proxy for {{ domain }}
Requires=docker.service
After=docker.service

[Service]
Restart=always
RestartSec=10
ExecStartPre=-/usr/bin/docker rm -f haproxy
ExecStart=/usr/bin/docker run --rm --name haproxy --net host -v /etc/kato/haproxy:/usr/local/etc/haproxy:ro haproxy:1.6
ExecStop=/usr/bin/docker stop haproxy

[Install]
WantedBy=multi-user.target
",
    ),
    drop_ins: &[],
};

const VOLUME_DRIVER: UnitTemplate = UnitTemplate {
    name: "rexray.service",
    command: Some("start"),
    enable: true,
    content: Some(
        "[Unit]
Description={{ storage_driver }} volume driver
Before=docker.service

[Service]
EnvironmentFile=-/etc/rexray/rexray.env
ExecStart=/opt/bin/rexray start -f
ExecReload=/bin/kill -HUP $MAINPID

[Install]
WantedBy=docker.service
",
    ),
    drop_ins: &[],
};

static MASTER_UNITS: [&UnitTemplate; 6] =
    [&ETCD2, &FLEET, &FLANNEL_MASTER, &DOCKER, &DNS_REGISTER, &FIREWALL];

static NODE_UNITS: [&UnitTemplate; 6] = [&ETCD2, &FLEET, &FLANNEL, &DOCKER, &DNS_REGISTER, &FIREWALL];

static EDGE_UNITS: [&UnitTemplate; 7] = [
    &ETCD2,
    &FLEET,
    &FLANNEL,
    &DOCKER,
    &DNS_REGISTER,
    &FIREWALL,
    &INGRESS,
];

/// Unit set activated for a role, in start order
pub(crate) fn units_for(role: NodeRole) -> &'static [&'static UnitTemplate] {
    match role {
        NodeRole::Master => &MASTER_UNITS,
        NodeRole::Node => &NODE_UNITS,
        NodeRole::Edge => &EDGE_UNITS,
    }
}

/// Unit started when a volume driver is configured
pub(crate) fn volume_driver_unit() -> &'static UnitTemplate {
    &VOLUME_DRIVER
}

/// Path `iptables-restore.service` loads rules from
pub(crate) const FIREWALL_RULES_PATH: &str = "/var/lib/iptables/rules-save";

/// iptables-save formatted rules; input is dropped unless allowed here
pub(crate) const FIREWALL_RULES: &str = "*filter
:INPUT DROP [0:0]
:FORWARD ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
-A INPUT -i lo -j ACCEPT
-A INPUT -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT
-A INPUT -p icmp -j ACCEPT
-A INPUT -p tcp --dport 22 -j ACCEPT
-A INPUT -s {{ overlay_network }} -j ACCEPT
-A INPUT -p udp -m multiport --dports 8285,8472 -j ACCEPT
{% if role == \"master\" %}
-A INPUT -p tcp -m multiport --dports 2379,2380 -j ACCEPT
{% endif %}
{% if role == \"edge\" %}
-A INPUT -p tcp -m multiport --dports 80,443 -j ACCEPT
{% endif %}
COMMIT
";
