//! Static MicroK8s addon catalog and enable/disable diffing
//!
//! The catalog is configuration data consumed read-only by the
//! orchestrator; it is never derived or mutated at runtime. Each entry
//! records where an addon must be toggled (masters, every node, or just the
//! connection node), the channel window it is available in, and any extra
//! commands its lifecycle needs.

use super::version::parse_major_minor;
use crate::types::AddonConfig;

/// Where an addon's enable/disable commands must run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequiredOn {
    /// Every master node
    Masters,
    /// Every node, masters and workers alike
    All,
    /// Only the node used as the SSH connection point
    Single,
}

/// Whether an addon takes arguments on enable
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentKind {
    /// The addon takes no arguments
    None,
    /// Arguments may be supplied (`microk8s enable name:args`)
    Optional,
    /// Arguments must be supplied (e.g. the metallb address pool)
    Required,
}

/// A catalog entry for one MicroK8s addon
#[derive(Clone, Copy, Debug)]
pub struct AddonSpec {
    /// Addon name as known to `microk8s enable`
    pub name: &'static str,
    /// Node scope for enable/disable commands
    pub required_on: RequiredOn,
    /// First channel (major.minor) the addon is available in
    pub available_from: &'static str,
    /// Channel the addon was removed in, if any
    pub available_until: Option<&'static str>,
    /// Argument schema
    pub arguments: ArgumentKind,
    /// Extra commands run after enabling
    pub extra_install: &'static [&'static str],
    /// Extra commands run after disabling
    pub extra_uninstall: &'static [&'static str],
}

impl AddonSpec {
    /// Whether the addon exists in the given channel
    pub fn available_in(&self, channel: &str) -> bool {
        let Some(current) = parse_major_minor(channel) else {
            return false;
        };
        let Some(from) = parse_major_minor(self.available_from) else {
            return false;
        };
        if current < from {
            return false;
        }
        match self.available_until.and_then(parse_major_minor) {
            Some(until) => current < until,
            None => true,
        }
    }

    /// The `microk8s enable` invocation for this addon
    pub fn enable_command(&self, args: &str) -> String {
        if args.is_empty() {
            format!("microk8s enable {}", self.name)
        } else {
            format!("microk8s enable {}:{}", self.name, args)
        }
    }

    /// The `microk8s disable` invocation for this addon
    pub fn disable_command(&self) -> String {
        format!("microk8s disable {}", self.name)
    }
}

macro_rules! addon {
    ($name:literal, $on:ident, $from:literal) => {
        addon!($name, $on, $from, None, ArgumentKind::None, &[], &[])
    };
    ($name:literal, $on:ident, $from:literal, $until:expr, $args:expr) => {
        addon!($name, $on, $from, $until, $args, &[], &[])
    };
    ($name:literal, $on:ident, $from:literal, $until:expr, $args:expr, $extra_i:expr, $extra_u:expr) => {
        AddonSpec {
            name: $name,
            required_on: RequiredOn::$on,
            available_from: $from,
            available_until: $until,
            arguments: $args,
            extra_install: $extra_i,
            extra_uninstall: $extra_u,
        }
    };
}

/// The addon catalog
///
/// Core addons first, community addons after. Scope assignments follow the
/// addon's own deployment model: cluster-level controllers toggle on
/// masters, per-node runtimes toggle everywhere, and node-local stores
/// toggle on the connection node only.
pub const ADDONS: &[AddonSpec] = &[
    // Core
    addon!("dns", Masters, "1.19", None, ArgumentKind::Optional),
    addon!("dashboard", Masters, "1.19"),
    addon!("helm", Masters, "1.19"),
    addon!("helm3", Masters, "1.19", Some("1.28"), ArgumentKind::None),
    addon!("ingress", Masters, "1.19"),
    addon!("metrics-server", Masters, "1.19"),
    addon!("rbac", Masters, "1.19"),
    addon!(
        "storage",
        Masters,
        "1.19",
        Some("1.24"),
        ArgumentKind::None,
        &[],
        &["microk8s disable storage:destroy-storage"]
    ),
    addon!("hostpath-storage", Masters, "1.24"),
    addon!("cert-manager", Masters, "1.25"),
    addon!("community", Masters, "1.24"),
    addon!("gpu", All, "1.19", None, ArgumentKind::Optional),
    addon!("host-access", All, "1.19", None, ArgumentKind::Optional),
    addon!("mayastor", Masters, "1.24", None, ArgumentKind::Optional),
    addon!("metallb", Masters, "1.17", None, ArgumentKind::Required),
    addon!("minio", Single, "1.25", None, ArgumentKind::Optional),
    addon!("observability", Masters, "1.25", None, ArgumentKind::Optional),
    addon!("prometheus", Masters, "1.19", Some("1.27"), ArgumentKind::None),
    addon!("registry", Single, "1.19", None, ArgumentKind::Optional),
    addon!("rook-ceph", Masters, "1.28"),
    addon!("kube-ovn", Masters, "1.26", None, ArgumentKind::Optional),
    // Community
    addon!("argocd", Masters, "1.24"),
    addon!("cilium", Masters, "1.19"),
    addon!("dashboard-ingress", Masters, "1.24"),
    addon!("easyhaproxy", Masters, "1.27"),
    addon!("fluentd", Masters, "1.19"),
    addon!("gopaddle-lite", Masters, "1.24", None, ArgumentKind::Optional),
    addon!("inaccel", All, "1.24"),
    addon!("istio", Masters, "1.19"),
    addon!("jaeger", Masters, "1.19"),
    addon!("kata", All, "1.22"),
    addon!("keda", Masters, "1.20"),
    addon!("knative", Masters, "1.19"),
    addon!("kwasm", All, "1.26"),
    addon!("linkerd", Masters, "1.19", None, ArgumentKind::Optional),
    addon!("microcks", Masters, "1.26"),
    addon!("multus", All, "1.19"),
    addon!("nfs", Masters, "1.24"),
    addon!("ntop", All, "1.24"),
    addon!("ondat", Masters, "1.24"),
    addon!("openebs", Masters, "1.21"),
    addon!("openfaas", Masters, "1.21", None, ArgumentKind::Optional),
    addon!("osm-edge", Masters, "1.25"),
    addon!("parking", Single, "1.24", None, ArgumentKind::Required),
    addon!("portainer", Masters, "1.20"),
    addon!("shifu", Masters, "1.24"),
    addon!("sosivio", Masters, "1.24"),
    addon!("traefik", Masters, "1.20"),
    addon!("trivy", Masters, "1.26"),
];

/// Look up a catalog entry by name
pub fn find(name: &str) -> Option<&'static AddonSpec> {
    ADDONS.iter().find(|a| a.name == name)
}

/// The enable/disable work needed to move a cluster from its current addon
/// configuration to a desired one
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddonDiff {
    /// Addons to disable, in catalog order
    pub disable: Vec<AddonConfig>,
    /// Addons to enable with their new arguments, in catalog order
    pub enable: Vec<AddonConfig>,
}

/// Diff the live addon state against a desired configuration
///
/// An addon moves to the disable set if it is currently enabled and either
/// absent from the desired set or requested with different arguments. It
/// moves to the enable set if newly requested or re-requested with
/// different arguments. Arguments of the live state come from the stored
/// configuration, since `microk8s status` does not report them.
pub fn diff_addons(
    live_enabled: &[String],
    stored: &[AddonConfig],
    desired: &[AddonConfig],
) -> AddonDiff {
    let stored_args = |name: &str| {
        stored
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.args.as_str())
            .unwrap_or("")
    };
    let desired_for = |name: &str| desired.iter().find(|a| a.name == name);

    let mut diff = AddonDiff::default();

    for name in live_enabled {
        match desired_for(name) {
            Some(want) if want.args == stored_args(name) => {}
            _ => diff
                .disable
                .push(AddonConfig::with_args(name.clone(), stored_args(name))),
        }
    }

    for want in desired {
        let currently_enabled = live_enabled.iter().any(|n| n == &want.name);
        if !currently_enabled || want.args != stored_args(&want.name) {
            diff.enable.push(want.clone());
        }
    }

    diff
}

/// Parse the enabled addon names out of `microk8s status --format short`
///
/// Lines look like `core/dns: enabled`; the repository prefix is stripped.
pub fn parse_enabled_addons(status_output: &str) -> Vec<String> {
    status_output
        .lines()
        .filter_map(|line| {
            let (name, state) = line.rsplit_once(':')?;
            if state.trim() != "enabled" {
                return None;
            }
            let name = name.trim();
            let name = name.rsplit('/').next().unwrap_or(name);
            Some(name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_names_are_unique() {
        for (i, a) in ADDONS.iter().enumerate() {
            assert!(
                !ADDONS[i + 1..].iter().any(|b| b.name == a.name),
                "duplicate addon '{}'",
                a.name
            );
        }
    }

    #[test]
    fn test_availability_window() {
        let metallb = find("metallb").unwrap();
        assert!(metallb.available_in("1.24/stable"));
        assert!(!metallb.available_in("1.16/stable"));

        let prometheus = find("prometheus").unwrap();
        assert!(prometheus.available_in("1.24/stable"));
        assert!(!prometheus.available_in("1.27/stable"));
        assert!(!prometheus.available_in("1.30/stable"));
    }

    #[test]
    fn test_enable_command_with_and_without_args() {
        let metallb = find("metallb").unwrap();
        assert_eq!(
            metallb.enable_command("10.64.140.43-10.64.140.49"),
            "microk8s enable metallb:10.64.140.43-10.64.140.49"
        );

        let dns = find("dns").unwrap();
        assert_eq!(dns.enable_command(""), "microk8s enable dns");
        assert_eq!(dns.disable_command(), "microk8s disable dns");
    }

    mod diffing {
        use super::*;

        /// Enabled {A, B(args=x)}, desired {B(args=y), C}: disable {A, B},
        /// enable {B(y), C}.
        #[test]
        fn test_changed_args_disable_then_reenable() {
            let live = vec!["ingress".to_string(), "metallb".to_string()];
            let stored = vec![
                AddonConfig::new("ingress"),
                AddonConfig::with_args("metallb", "10.0.0.1-10.0.0.10"),
            ];
            let desired = vec![
                AddonConfig::with_args("metallb", "10.1.0.1-10.1.0.10"),
                AddonConfig::new("cert-manager"),
            ];

            let diff = diff_addons(&live, &stored, &desired);

            let disabled: Vec<&str> = diff.disable.iter().map(|a| a.name.as_str()).collect();
            assert_eq!(disabled, vec!["ingress", "metallb"]);

            let enabled: Vec<(&str, &str)> = diff
                .enable
                .iter()
                .map(|a| (a.name.as_str(), a.args.as_str()))
                .collect();
            assert_eq!(
                enabled,
                vec![("metallb", "10.1.0.1-10.1.0.10"), ("cert-manager", "")]
            );
        }

        #[test]
        fn test_unchanged_addons_are_untouched() {
            let live = vec!["dns".to_string()];
            let stored = vec![AddonConfig::new("dns")];
            let desired = vec![AddonConfig::new("dns")];

            let diff = diff_addons(&live, &stored, &desired);
            assert!(diff.disable.is_empty());
            assert!(diff.enable.is_empty());
        }

        #[test]
        fn test_addon_enabled_out_of_band_is_disabled_when_not_desired() {
            // An operator enabled an addon by hand; the desired config does
            // not list it, so the diff removes it.
            let live = vec!["jaeger".to_string()];
            let diff = diff_addons(&live, &[], &[]);
            assert_eq!(diff.disable.len(), 1);
            assert_eq!(diff.disable[0].name, "jaeger");
        }
    }

    #[test]
    fn test_parse_enabled_addons_strips_repository_prefix() {
        let status = "\
core/dns: enabled
core/ha-cluster: enabled
core/ingress: disabled
community/istio: enabled
";
        let enabled = parse_enabled_addons(status);
        assert_eq!(enabled, vec!["dns", "ha-cluster", "istio"]);
    }
}
