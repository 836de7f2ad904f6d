//! Annotation keys stamped on testruns.

/// Number of retries that preceded this attempt.
pub const RETRIES: &str = "testrunner.testmachinery.gardener.cloud/retries";

/// Name of the attempt this testrun supersedes.
pub const PREVIOUS_ATTEMPT: &str = "testrunner.testmachinery.gardener.cloud/previous-attempt";

/// Identifier shared by every attempt of one orchestrated run.
pub const EXECUTION_GROUP: &str = "testrunner.testmachinery.gardener.cloud/execution-group";

pub const K8S_VERSION: &str = "metadata.testmachinery.gardener.cloud/k8sVersion";
pub const CLOUD_PROVIDER: &str = "metadata.testmachinery.gardener.cloud/cloudprovider";
pub const OPERATING_SYSTEM: &str = "metadata.testmachinery.gardener.cloud/operating-system";
pub const OPERATING_SYSTEM_VERSION: &str =
    "metadata.testmachinery.gardener.cloud/operating-system-version";
pub const REGION: &str = "metadata.testmachinery.gardener.cloud/region";
pub const ZONE: &str = "metadata.testmachinery.gardener.cloud/zone";
pub const ALLOW_PRIVILEGED_CONTAINERS: &str =
    "metadata.testmachinery.gardener.cloud/allow-privileged-containers";
pub const FLAVOR_DESCRIPTION: &str = "metadata.testmachinery.gardener.cloud/flavor-description";

/// `provider/k8sVersion/os[/description]` summary of a matrix cell.
pub const DIMENSION: &str = "metadata.testmachinery.gardener.cloud/dimension";
