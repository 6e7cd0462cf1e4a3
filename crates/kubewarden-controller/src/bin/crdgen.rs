use kube::core::CustomResourceExt;
use kubewarden_controller::crds::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    PolicyServer,
};

fn main() -> Result<(), serde_yaml::Error> {
    let crds = vec![
        PolicyServer::crd(),
        ClusterAdmissionPolicy::crd(),
        AdmissionPolicy::crd(),
        ClusterAdmissionPolicyGroup::crd(),
        AdmissionPolicyGroup::crd(),
    ];
    for (i, crd) in crds.into_iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        println!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
