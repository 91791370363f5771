//! Converts catalog entries into label sets.

use crate::catalog::NodeEntry;
use crate::target_group::LabelSet;

/// The label holding the address a target is scraped at.
pub const ADDRESS_LABEL: &str = "__address__";
/// The node address.
pub const NODE_ADDRESS_LABEL: &str = "__meta_consul_address";
/// The node name.
pub const NODE_LABEL: &str = "__meta_consul_node";
/// Prefix of the labels mapping the node metadata.
pub const METADATA_LABEL_PREFIX: &str = "__meta_consul_metadata_";
/// The service tags, joined and surrounded by the tag separator.
pub const TAGS_LABEL: &str = "__meta_consul_tags";
pub const SERVICE_LABEL: &str = "__meta_consul_service";
/// The service address, which might be empty.
pub const SERVICE_ADDRESS_LABEL: &str = "__meta_consul_service_address";
pub const SERVICE_PORT_LABEL: &str = "__meta_consul_service_port";
pub const DATACENTER_LABEL: &str = "__meta_consul_dc";
pub const SERVICE_ID_LABEL: &str = "__meta_consul_service_id";

/// Labels shared by every target of a service.
pub fn common_labels(service: &str, datacenter: &str) -> LabelSet {
    LabelSet::from([
        (SERVICE_LABEL.to_string(), service.to_string()),
        (DATACENTER_LABEL.to_string(), datacenter.to_string()),
    ])
}

/// Build the labels of one service instance.
pub fn target_labels(entry: &NodeEntry, separator: &str) -> LabelSet {
    // if the service address is not empty it should be used instead of the node
    // address since the service may be registered remotely through a different node.
    let host = if entry.service_address.is_empty() {
        &entry.address
    } else {
        &entry.service_address
    };

    let mut labels = LabelSet::from([
        (
            ADDRESS_LABEL.to_string(),
            join_host_port(host, entry.service_port),
        ),
        (NODE_ADDRESS_LABEL.to_string(), entry.address.clone()),
        (NODE_LABEL.to_string(), entry.node.clone()),
        (
            TAGS_LABEL.to_string(),
            join_tags(&entry.service_tags, separator),
        ),
        (
            SERVICE_ADDRESS_LABEL.to_string(),
            entry.service_address.clone(),
        ),
        (
            SERVICE_PORT_LABEL.to_string(),
            entry.service_port.to_string(),
        ),
        (SERVICE_ID_LABEL.to_string(), entry.service_id.clone()),
    ]);

    for (key, value) in &entry.node_meta {
        labels.insert(
            format!("{METADATA_LABEL_PREFIX}{}", sanitize_label_name(key)),
            value.clone(),
        );
    }

    labels
}

/// The separator surrounds the joined list as well, so relabeling regexes
/// never have to care about the tag position.
pub fn join_tags(tags: &[String], separator: &str) -> String {
    format!("{separator}{}{separator}", tags.join(separator))
}

/// Hosts containing a colon are IPv6 literals and get bracketed.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Replace every character outside of `[a-zA-Z0-9_]` with `_`.
pub fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
