use std::fs;

use fleet_control::certs::fingerprint;

use crate::common::TestFleet;

#[tokio::test]
async fn test_rotation_bootstraps_then_holds() {
    let cluster = TestFleet::new();
    let auth = &cluster.fleet.auth;

    assert!(auth.setup_mtls().is_err());
    assert!(auth.rotate_certificates().unwrap());

    let settings = auth.setup_mtls().unwrap();
    assert!(auth.certificates().validate_certificate_chain(&settings.cert_file));
    let issued = fingerprint(&settings.cert_file).unwrap();

    assert!(!auth.rotate_certificates().unwrap());
    assert_eq!(fingerprint(&settings.cert_file).unwrap(), issued);

    assert!(auth.server_config().is_ok());
    assert!(auth.client_config().is_ok());
}

#[tokio::test]
async fn test_node_certificate_chain_export() {
    let cluster = TestFleet::new();
    let certs = cluster.fleet.auth.certificates();

    assert!(certs.generate_ca().unwrap());
    assert!(!certs.generate_ca().unwrap());

    let issued = certs.generate_node_certificate("edge-1").unwrap();
    let chain = certs.export_certificate_chain("edge-1").unwrap();
    let text = fs::read_to_string(&chain).unwrap();
    assert!(text.starts_with(&fs::read_to_string(&issued.cert).unwrap()));
    assert!(certs.validate_certificate_chain(&chain));
}
