use std::collections::HashMap;

use vpcnet::config::NetConf;
use vpcnet::plugin::VpcNetPlugin;
use vpcnet::types::{CmdArgs, ErrorResult, Interface, IPConfig, Result as CniResult, Route, VersionResult};

fn conf() -> NetConf {
    NetConf {
        cni_version: "1.0.0".to_string(),
        name: "test-vpc".to_string(),
        plugin_type: "vpcnet".to_string(),
        data_dir: None,
        eni_map_path: None,
        log_verbosity: 2,
        lock_timeout_secs: Some(5),
        mtu: Some(9001),
    }
}

#[test]
fn test_net_conf_round_trips_through_stdin_format() -> Result<(), Box<dyn std::error::Error>> {
    let conf = conf();
    let bytes = serde_json::to_vec(&conf)?;
    let parsed = NetConf::parse(&bytes)?;

    assert_eq!(parsed.cni_version, "1.0.0");
    assert_eq!(parsed.name, "test-vpc");
    assert_eq!(parsed.plugin_type, "vpcnet");
    assert_eq!(parsed.log_verbosity, 2);
    assert_eq!(parsed.lock_timeout_secs, Some(5));
    assert_eq!(parsed.mtu, Some(9001));

    let raw: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(raw["type"], "vpcnet");
    assert_eq!(raw["lockTimeoutSecs"], 5);
    assert!(raw.get("dataDir").is_none());

    Ok(())
}

#[test]
fn test_cmd_args_netns() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = CmdArgs {
        container_id: "test-container".to_string(),
        netns: "/var/run/netns/test".to_string(),
        ifname: "eth0".to_string(),
        args: HashMap::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: serde_json::to_vec(&conf())?,
    };

    assert_eq!(
        args.netns_path().as_deref(),
        Some(std::path::Path::new("/var/run/netns/test"))
    );

    args.netns = String::new();
    assert!(args.netns_path().is_none());

    // Construction alone must not touch the host.
    let _plugin = VpcNetPlugin::new(conf(), args);

    Ok(())
}

#[test]
fn test_cni_result_serialization() -> Result<(), Box<dyn std::error::Error>> {
    let mut result = CniResult::new("1.0.0");
    result.add_interface(Interface {
        name: "vpc1a2b3c4d5e6f".to_string(),
        mac: Some("0a:00:00:00:00:01".to_string()),
        sandbox: None,
    });
    let idx = result.add_interface(Interface {
        name: "eth0".to_string(),
        mac: Some("0a:00:00:00:00:02".to_string()),
        sandbox: Some("/var/run/netns/test".to_string()),
    });
    result.add_ip(IPConfig {
        interface: Some(idx),
        address: "10.0.1.5/32".to_string(),
        gateway: Some("169.254.1.1".to_string()),
    });
    result.add_route(Route {
        dst: "0.0.0.0/0".to_string(),
        gw: Some("169.254.1.1".to_string()),
    });

    let serialized = serde_json::to_string(&result)?;
    let value: serde_json::Value = serde_json::from_str(&serialized)?;
    assert_eq!(value["cniVersion"], "1.0.0");
    assert_eq!(value["ips"][0]["interface"], 1);
    assert!(value["interfaces"][0].get("sandbox").is_none());
    assert!(value.get("dns").is_none());

    let deserialized: CniResult = serde_json::from_str(&serialized)?;
    assert_eq!(deserialized.interfaces.map(|i| i.len()), Some(2));
    assert!(deserialized.dns.is_none());

    Ok(())
}

#[test]
fn test_error_and_version_documents() -> Result<(), Box<dyn std::error::Error>> {
    let err = ErrorResult {
        cni_version: "1.0.0".to_string(),
        code: 11,
        msg: "timed out waiting for store lock".to_string(),
        details: String::new(),
    };
    let value: serde_json::Value = serde_json::to_value(&err)?;
    assert_eq!(value["code"], 11);
    assert!(value.get("details").is_none());

    let version = serde_json::to_value(VersionResult::default())?;
    assert_eq!(version["cniVersion"], "1.0.0");
    assert!(version["supportedVersions"]
        .as_array()
        .map_or(false, |v| v.iter().any(|s| s == "0.4.0")));

    Ok(())
}
