pub mod policy;
pub mod policy_server;

pub use policy::{
    AdmissionPolicy, AdmissionPolicyGroup, AdmissionPolicyGroupSpec, AdmissionPolicySpec,
    AnyPolicy, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    ClusterAdmissionPolicyGroupSpec, ClusterAdmissionPolicySpec, Policy, PolicyGroupMember,
    PolicyMode, PolicyStatus, PolicyStatusEnum,
};
pub use policy_server::{PolicyServer, PolicyServerSpec, PolicyServerStatus};

pub const GROUP: &str = "policies.kubewarden.io";
