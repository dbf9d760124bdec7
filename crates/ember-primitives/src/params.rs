//! Chain parameters.
//!
//! One plain struct populated from a closed set of presets. The
//! Unittest preset additionally allows mutating selected values so
//! tests can shrink intervals without minting their own network.

use bitcoin::pow::Target;

/// The networks an Ember node can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// The production network.
    Main,
    /// The public test network.
    Testnet,
    /// Local regression testing.
    Regtest,
    /// In-process unit tests.
    Unittest,
    /// The pre-release staging network.
    Betatest,
}

impl Network {
    /// Short tag naming the network, also used as the datadir suffix.
    pub fn name(&self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
            Network::Unittest => "unittest",
            Network::Betatest => "beta",
        }
    }
}

/// A consensus rule change gated on time and miner signalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BipDeployment {
    /// Version bit the deployment signals on, in `0..29`.
    pub bit: u8,
    /// Median-time-past at which signalling may begin.
    pub start_time: i64,
    /// Median-time-past at which the deployment expires.
    pub timeout: i64,
    /// Length of a signalling period in blocks.
    pub period: u32,
    /// Number of signalling blocks per period required to lock in.
    pub threshold: u32,
}

impl BipDeployment {
    /// Sentinel `start_time` forcing the deployment active from genesis.
    pub const ALWAYS_ACTIVE: i64 = -1;
}

/// Known deployments, indexing [`ChainParams::deployments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentPos {
    /// Deployment exercised by tests, never active on main.
    TestDummy = 0,
}

/// Number of entries in the deployment table.
pub const MAX_VERSION_BITS_DEPLOYMENTS: usize = 1;

/// Parameters of one network, selected once at startup.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Which network these parameters describe.
    pub network: Network,
    /// Height of the last proof-of-work block; staking rules apply above.
    pub last_pow_block: u32,
    /// Easiest admissible proof-of-work target.
    pub pow_limit: Target,
    /// Deepest reorganization the node will follow.
    pub max_reorg_depth: u32,
    /// Version-bits deployment table, indexed by [`DeploymentPos`].
    pub deployments: [BipDeployment; MAX_VERSION_BITS_DEPLOYMENTS],
}

/// A deployment slot that never activates.
const NO_DEPLOYMENT: BipDeployment = BipDeployment {
    bit: 28,
    start_time: 0,
    timeout: 0,
    period: 2016,
    threshold: 1916,
};

impl ChainParams {
    /// Constructs the parameters of `network`.
    pub fn new(network: Network) -> Self {
        match network {
            Network::Main => Self {
                network,
                last_pow_block: 1_000,
                pow_limit: max_target_shr(20),
                max_reorg_depth: 100,
                deployments: [NO_DEPLOYMENT],
            },
            Network::Testnet => Self {
                network,
                last_pow_block: 100,
                pow_limit: max_target_shr(20),
                max_reorg_depth: 100,
                deployments: [NO_DEPLOYMENT],
            },
            Network::Regtest => Self {
                network,
                last_pow_block: 100,
                pow_limit: max_target_shr(1),
                max_reorg_depth: 100,
                deployments: [BipDeployment {
                    bit: 28,
                    start_time: 0,
                    timeout: i64::MAX,
                    period: 144,
                    threshold: 108,
                }],
            },
            // Unit tests inherit the main parameters but may mutate
            // them through the setters below.
            Network::Unittest => Self {
                network,
                ..Self::new(Network::Main)
            },
            // The staging network runs its own chain; it shares
            // nothing with main at runtime.
            Network::Betatest => Self {
                network,
                last_pow_block: 56_700,
                pow_limit: max_target_shr(20),
                max_reorg_depth: 100,
                deployments: [NO_DEPLOYMENT],
            },
        }
    }

    /// The descriptor of `pos`.
    pub fn deployment(&self, pos: DeploymentPos) -> &BipDeployment {
        &self.deployments[pos as usize]
    }

    /// Overrides the last proof-of-work height. Unittest only.
    pub fn set_last_pow_block(&mut self, height: u32) {
        assert_eq!(self.network, Network::Unittest);
        self.last_pow_block = height;
    }

    /// Overrides a deployment descriptor. Unittest only.
    pub fn set_deployment(&mut self, pos: DeploymentPos, deployment: BipDeployment) {
        assert_eq!(self.network, Network::Unittest);
        self.deployments[pos as usize] = deployment;
    }
}

/// The all-ones target shifted right by `shift` bits.
fn max_target_shr(shift: usize) -> Target {
    let mut bytes = [0xff_u8; 32];
    let full = shift / 8;
    for byte in bytes.iter_mut().take(full) {
        *byte = 0;
    }
    if full < 32 {
        bytes[full] = 0xff >> (shift % 8);
    }
    Target::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_differ_where_it_matters() {
        let main = ChainParams::new(Network::Main);
        let beta = ChainParams::new(Network::Betatest);
        assert_eq!(main.last_pow_block, 1_000);
        assert_eq!(beta.last_pow_block, 56_700);
        assert_ne!(main.network.name(), beta.network.name());

        let regtest = ChainParams::new(Network::Regtest);
        assert!(regtest.pow_limit > main.pow_limit);
    }

    #[test]
    fn unittest_setters_apply() {
        let mut params = ChainParams::new(Network::Unittest);
        assert_eq!(params.last_pow_block, 1_000);
        params.set_last_pow_block(10);
        assert_eq!(params.last_pow_block, 10);

        params.set_deployment(
            DeploymentPos::TestDummy,
            BipDeployment {
                bit: 28,
                start_time: 100,
                timeout: 1_000,
                period: 10,
                threshold: 8,
            },
        );
        assert_eq!(params.deployment(DeploymentPos::TestDummy).period, 10);
    }

    #[test]
    #[should_panic]
    fn setters_reject_non_unittest_networks() {
        let mut params = ChainParams::new(Network::Main);
        params.set_last_pow_block(10);
    }
}
