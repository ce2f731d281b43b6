//! Structural validation of server records.
//!
//! Inventory records are decoded leniently, so a server with a mistyped
//! field still reaches the pipeline. This filter is where it stops, with a
//! reason naming the first offending field.

use berth_core::{Lenient, Server, VmSummary};
use tracing::warn;
use uuid::Uuid;

use crate::candidate::Candidate;
use crate::step::{Outcome, Step, StepContext};

/// Removes servers whose records are malformed.
pub struct Valid;

impl Step for Valid {
    fn name(&self) -> &'static str {
        "Servers objects which are valid"
    }

    fn run(&self, candidates: &[Candidate<'_>], _ctx: &mut StepContext<'_>) -> Outcome {
        Outcome::partition(candidates, |c| {
            let problem = validate_server(c.server)?;
            // Unsetup servers routinely carry partial records.
            if c.server.is_setup() {
                warn!(server = %c.id(), problem = %problem, "invalid server record");
            }
            Some(problem)
        })
    }
}

/// The first structural problem with a server record, if any.
pub fn validate_server(server: &Server) -> Option<String> {
    if server.uuid.is_empty() {
        return Some("Server has no uuid".to_string());
    }
    let id = &server.uuid;
    let sysinfo = server.sysinfo();

    let strings = [
        ("status", &server.status),
        ("hostname", &server.hostname),
        ("current_platform", &server.current_platform),
        ("SDC Version", &sysinfo.platform_version),
    ];
    for (field, value) in strings {
        if value.is_malformed() {
            return Some(format!("Server {id} {field} is not a string"));
        }
    }

    let required = [
        ("memory_total_bytes", &server.memory_total_bytes),
        ("memory_available_bytes", &server.memory_available_bytes),
        ("disk_pool_size_bytes", &server.disk_pool_size_bytes),
        ("disk_installed_images_used_bytes", &server.disk_installed_images_used_bytes),
    ];
    for (field, value) in required {
        if value.valid().is_none_or(|v| !v.is_finite()) {
            return Some(format!("Server {id} {field} is not a number"));
        }
    }

    let optional = [
        ("disk_zone_quota_bytes", &server.disk_zone_quota_bytes),
        ("disk_kvm_quota_bytes", &server.disk_kvm_quota_bytes),
        ("reservation_ratio", &server.reservation_ratio),
        ("CPU Total Cores", &sysinfo.cpu_total_cores),
    ];
    for (field, value) in optional {
        let broken = match value {
            Lenient::Missing => false,
            Lenient::Valid(v) => !v.is_finite(),
            Lenient::Malformed(_) => true,
        };
        if broken {
            return Some(format!("Server {id} {field} is not a number"));
        }
    }

    for (field, value) in [("reserved", &server.reserved), ("headnode", &server.headnode)] {
        if value.is_malformed() {
            return Some(format!("Server {id} \"{field}\" is not a boolean"));
        }
    }

    if server.overprovision_ratios.is_malformed() {
        return Some(format!("Server {id} overprovision ratios are malformed"));
    }
    if server.traits.is_malformed() {
        return Some(format!("Server {id} traits are malformed"));
    }

    let maps = [
        ("sysinfo", server.sysinfo.is_malformed()),
        ("sysinfo \"Network Interfaces\"", sysinfo.network_interfaces.is_malformed()),
        ("sysinfo \"Virtual Network Interfaces\"", sysinfo.virtual_network_interfaces.is_malformed()),
        ("vms", server.vms.is_malformed()),
    ];
    if let Some((field, _)) = maps.iter().find(|(_, malformed)| *malformed) {
        return Some(format!("Server {id} {field} is malformed"));
    }

    server.vms().iter().find_map(|(vm_id, vm)| validate_vm(vm_id, vm))
}

fn validate_vm(vm_id: &str, vm: &VmSummary) -> Option<String> {
    let well_formed = vm.owner().is_some_and(|owner| Uuid::parse_str(owner).is_ok());
    if !well_formed {
        return Some(format!("VM {vm_id} has malformed owner_uuid: {}", vm.owner_uuid.describe()));
    }
    let strings = [
        ("uuid", &vm.uuid),
        ("state", &vm.state),
        ("brand", &vm.brand),
        ("last_modified", &vm.last_modified),
    ];
    strings
        .iter()
        .find(|(_, value)| value.is_malformed())
        .map(|(field, _)| format!("VM {vm_id} {field} is not a string"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, OWNER, add_vm, kept_ids, make_server, make_vm, sysinfo_mut};
    use serde_json::json;

    #[test]
    fn healthy_server_is_valid() {
        let mut server = make_server("cn0");
        add_vm(&mut server, "vm-a", make_vm(OWNER));
        assert_eq!(validate_server(&server), None);
    }

    #[test]
    fn missing_uuid_is_reported_first() {
        let mut server = make_server("");
        server.memory_total_bytes = Lenient::Missing;
        assert_eq!(validate_server(&server).as_deref(), Some("Server has no uuid"));
    }

    #[test]
    fn required_capacity_figures_must_be_numbers() {
        let mut missing = make_server("cn0");
        missing.memory_available_bytes = Lenient::Missing;
        assert_eq!(
            validate_server(&missing).as_deref(),
            Some("Server cn0 memory_available_bytes is not a number")
        );

        let mut mistyped = make_server("cn1");
        mistyped.disk_pool_size_bytes = Lenient::Malformed(json!("1TB"));
        assert_eq!(
            validate_server(&mistyped).as_deref(),
            Some("Server cn1 disk_pool_size_bytes is not a number")
        );
    }

    #[test]
    fn optional_figures_are_checked_only_when_present() {
        let mut server = make_server("cn0");
        server.disk_kvm_quota_bytes = Lenient::Missing;
        assert_eq!(validate_server(&server), None);

        sysinfo_mut(&mut server).cpu_total_cores = Lenient::Malformed(json!("eight"));
        assert_eq!(validate_server(&server).as_deref(), Some("Server cn0 CPU Total Cores is not a number"));
    }

    #[test]
    fn flags_ratios_and_traits_must_be_well_typed() {
        let mut reserved = make_server("cn0");
        reserved.reserved = Lenient::Malformed(json!("false"));
        assert_eq!(validate_server(&reserved).as_deref(), Some("Server cn0 \"reserved\" is not a boolean"));

        let mut ratios = make_server("cn1");
        ratios.overprovision_ratios = Lenient::Malformed(json!({ "cpu": "lots" }));
        assert_eq!(
            validate_server(&ratios).as_deref(),
            Some("Server cn1 overprovision ratios are malformed")
        );

        let mut traits = make_server("cn2");
        traits.traits = Lenient::Malformed(json!(["ssd"]));
        assert_eq!(validate_server(&traits).as_deref(), Some("Server cn2 traits are malformed"));
    }

    #[test]
    fn vm_owner_must_be_a_uuid() {
        let mut server = make_server("cn0");
        add_vm(&mut server, "vm-a", make_vm("not-a-uuid"));
        assert_eq!(
            validate_server(&server).as_deref(),
            Some("VM vm-a has malformed owner_uuid: \"not-a-uuid\"")
        );

        add_vm(&mut server, "vm-a", VmSummary { owner_uuid: Lenient::Missing, ..make_vm(OWNER) });
        assert_eq!(
            validate_server(&server).as_deref(),
            Some("VM vm-a has malformed owner_uuid: null")
        );
    }

    #[test]
    fn mistyped_strings_and_maps_are_named() {
        let mut status = make_server("cn0");
        status.status = Lenient::Malformed(json!(1));
        assert_eq!(validate_server(&status).as_deref(), Some("Server cn0 status is not a string"));

        let mut version = make_server("cn1");
        sysinfo_mut(&mut version).platform_version = Lenient::Malformed(json!(7.0));
        assert_eq!(validate_server(&version).as_deref(), Some("Server cn1 SDC Version is not a string"));

        let mut sysinfo = make_server("cn2");
        sysinfo.sysinfo = Lenient::Malformed(json!("n/a"));
        assert_eq!(validate_server(&sysinfo).as_deref(), Some("Server cn2 sysinfo is malformed"));

        let mut nics = make_server("cn3");
        sysinfo_mut(&mut nics).network_interfaces = Lenient::Malformed(json!(["ixgbe0"]));
        assert_eq!(
            validate_server(&nics).as_deref(),
            Some("Server cn3 sysinfo \"Network Interfaces\" is malformed")
        );

        let mut vms = make_server("cn4");
        vms.vms = Lenient::Malformed(json!([]));
        assert_eq!(validate_server(&vms).as_deref(), Some("Server cn4 vms is malformed"));
    }

    #[test]
    fn vm_fields_must_be_strings() {
        let mut server = make_server("cn0");
        add_vm(&mut server, "vm-a", VmSummary { state: Lenient::Malformed(json!(3)), ..make_vm(OWNER) });
        assert_eq!(validate_server(&server).as_deref(), Some("VM vm-a state is not a string"));
    }

    #[test]
    fn invalid_servers_are_removed_with_their_reason() {
        let mut broken = make_server("cn1");
        broken.memory_total_bytes = Lenient::Malformed(json!("big"));
        let mut unsetup = make_server("cn2");
        unsetup.setup = Lenient::Valid(false);
        unsetup.reserved = Lenient::Malformed(json!(1));
        let servers = vec![make_server("cn0"), broken, unsetup];

        let outcome = Fixture::new().run(&Valid, &servers);
        assert_eq!(kept_ids(&outcome, &servers), ["cn0"]);
        assert_eq!(
            outcome.reasons().server("cn1"),
            Some("Server cn1 memory_total_bytes is not a number")
        );
        assert_eq!(outcome.reasons().server("cn2"), Some("Server cn2 \"reserved\" is not a boolean"));
    }
}
