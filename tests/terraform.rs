//! Terraform emission: a hermetic document with symbolic cross-references
//! and zero cloud traffic.

mod common;

use cloudup::cloud::CloudProvider;
use cloudup::target::TerraformTarget;
use cloudup::{Context, Target};
use serde_json::Value;

use common::{fixture, mock_cloud, SharedBuf, CLUSTER_NAME, LB_NAME, REGION, ZONE};

#[test]
fn emission_is_hermetic_and_cross_references_symbolically() {
    let f = fixture();
    let mut tasks = f.build_tasks();

    let mock = mock_cloud();
    let cloud = mock.cloud(CloudProvider::Aws, REGION, CLUSTER_NAME);
    let (ca, secrets) = f.stores();

    let out = SharedBuf::default();
    let target = Target::Terraform(TerraformTarget::new(
        "aws",
        REGION,
        Box::new(out.clone()),
    ));
    // Even when asked to check existing state, Terraform runs never do.
    let mut ctx = Context::new(target, cloud, ca, secrets, true);
    assert!(!ctx.check_existing);

    ctx.run_tasks(&mut tasks).unwrap();
    ctx.finish(&tasks).unwrap();

    // No describes, no mutations: the document is self-contained.
    assert_eq!(mock.reads(), 0);
    assert_eq!(mock.writes(), 0);

    let doc: Value = serde_json::from_str(&out.contents()).unwrap();
    assert_eq!(doc["provider"]["aws"]["region"], Value::String(REGION.into()));

    let resources = &doc["resource"];
    assert_eq!(
        resources["aws_vpc"]["main"]["cidr_block"],
        Value::String("172.20.0.0/16".into())
    );
    assert_eq!(
        resources["aws_subnet"][ZONE]["vpc_id"],
        Value::String("${aws_vpc.main.id}".into())
    );
    assert_eq!(
        resources["aws_subnet"][ZONE]["cidr_block"],
        Value::String("172.20.0.0/19".into())
    );
    assert_eq!(
        resources["aws_route"]["default"]["gateway_id"],
        Value::String("${aws_internet_gateway.main.id}".into())
    );
    assert_eq!(
        resources["aws_route_table_association"][ZONE]["route_table_id"],
        Value::String("${aws_route_table.main.id}".into())
    );

    // The image reference stays unresolved: resolving would need a read.
    assert_eq!(
        resources["aws_launch_configuration"]["nodes"]["image_id"],
        Value::String(common::IMAGE_NAME.into())
    );
    assert_eq!(
        resources["aws_autoscaling_group"]["nodes"]["launch_configuration"],
        Value::String("${aws_launch_configuration.nodes.id}".into())
    );

    assert_eq!(
        resources["aws_route53_record"]["api.k.example.com"]["alias"]["name"],
        Value::String(format!("${{aws_elb.{LB_NAME}.dns_name}}"))
    );
    assert_eq!(
        resources["aws_route53_record"]["api.k.example.com"]["zone_id"],
        Value::String("${aws_route53_zone.example.com.zone_id}".into())
    );

    // Security group rules reference siblings symbolically too.
    let masters_rules = resources["aws_security_group"]["masters"]["ingress"]
        .as_array()
        .unwrap();
    assert!(masters_rules.iter().any(|rule| {
        rule["security_groups"]
            .as_array()
            .map(|groups| groups.contains(&Value::String("${aws_security_group.nodes.id}".into())))
            .unwrap_or(false)
    }));
}

#[test]
fn keypairs_still_issue_into_the_local_store() {
    let f = fixture();
    let mut tasks = f.build_tasks();

    let mock = mock_cloud();
    let cloud = mock.cloud(CloudProvider::Aws, REGION, CLUSTER_NAME);
    let (ca, secrets) = f.stores();

    let target = Target::Terraform(TerraformTarget::new(
        "aws",
        REGION,
        Box::new(std::io::sink()),
    ));
    let mut ctx = Context::new(target, cloud, ca, secrets, false);
    ctx.run_tasks(&mut tasks).unwrap();
    ctx.finish(&tasks).unwrap();

    let (ca, _) = f.stores();
    assert!(ca.get("master").unwrap().is_some());
}
