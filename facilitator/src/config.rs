use std::{env, fs, net::SocketAddr, path::Path, str::FromStr};

use comms::{
    msg::Rank,
    specs::segment::{ActFnSpec, LayerSpec, OptimizerSpec, SegmentSpec},
};

use crate::error::{FacilitatorErr, Result};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_RANK: Rank = 1;
const DEFAULT_SERVER_RANK: Rank = 0;
const DEFAULT_WORLD_SIZE: u32 = 3;

/// The transport the bus is built on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Peers connect over TCP to `listen` and announce their rank.
    Tcp { listen: SocketAddr },
    /// Peers live in the same process and talk over in-memory pipes.
    Memory,
}

/// Immutable identity of the facilitator within the communication group.
#[derive(Debug, Clone)]
pub struct FacilitatorConfig {
    rank: Rank,
    world_size: u32,
    server_rank: Rank,
    backend: Backend,
}

impl FacilitatorConfig {
    /// Creates a new facilitator configuration.
    ///
    /// # Args
    /// * `rank` - The facilitator's own rank.
    /// * `world_size` - The size of the group, the highest rank plus one.
    /// * `server_rank` - The rank of the process holding the final layers.
    /// * `backend` - The transport selector.
    ///
    /// # Errors
    /// Returns `InvalidConfig` unless there's room for at least one client and both
    /// ranks are distinct members of the group.
    pub fn new(rank: Rank, world_size: u32, server_rank: Rank, backend: Backend) -> Result<Self> {
        if world_size < 3 {
            return Err(FacilitatorErr::InvalidConfig(format!(
                "world size must fit a client, a facilitator and a server, got {world_size}"
            )));
        }

        if rank >= world_size || server_rank >= world_size {
            return Err(FacilitatorErr::InvalidConfig(format!(
                "ranks {rank} and {server_rank} must be below the world size {world_size}"
            )));
        }

        if rank == server_rank {
            return Err(FacilitatorErr::InvalidConfig(format!(
                "facilitator and server can't share rank {rank}"
            )));
        }

        Ok(Self {
            rank,
            world_size,
            server_rank,
            backend,
        })
    }

    /// Reads the configuration from the process environment.
    ///
    /// See `from_lookup` for the variables involved.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// Reads `RANK`, `WORLD_SIZE`, `SERVER_RANK` and `BACKEND` (`tcp` or `memory`),
    /// the tcp backend also reads `HOST` and the mandatory `PORT`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rank = parse(&lookup, "RANK", Some(DEFAULT_RANK))?;
        let world_size = parse(&lookup, "WORLD_SIZE", Some(DEFAULT_WORLD_SIZE))?;
        let server_rank = parse(&lookup, "SERVER_RANK", Some(DEFAULT_SERVER_RANK))?;

        let backend = match lookup("BACKEND").as_deref().unwrap_or("tcp") {
            "tcp" => {
                let host = lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
                let port: u16 = parse(&lookup, "PORT", None)?;
                let listen = format!("{host}:{port}").parse().map_err(|e| {
                    FacilitatorErr::InvalidConfig(format!("bad listen address {host}:{port}: {e}"))
                })?;

                Backend::Tcp { listen }
            }
            "memory" => Backend::Memory,
            other => {
                return Err(FacilitatorErr::InvalidConfig(format!(
                    "unknown backend {other}, expected tcp or memory"
                )));
            }
        };

        Self::new(rank, world_size, server_rank, backend)
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn server_rank(&self) -> Rank {
        self.server_rank
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Whether `rank` belongs to a client of this group.
    pub fn is_client(&self, rank: Rank) -> bool {
        rank < self.world_size && rank != self.rank && rank != self.server_rank
    }

    /// Every rank the facilitator links to, the server's included.
    pub fn peers(&self) -> impl Iterator<Item = Rank> + '_ {
        (0..self.world_size).filter(move |rank| *rank != self.rank)
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: Option<T>) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match (lookup(key), default) {
        (Some(value), _) => value
            .trim()
            .parse()
            .map_err(|e| FacilitatorErr::InvalidConfig(format!("{key}={value}: {e}"))),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(FacilitatorErr::InvalidConfig(format!("{key} is not set"))),
    }
}

/// The segment used when no specification file is given.
pub fn default_segment() -> SegmentSpec {
    SegmentSpec {
        layers: vec![LayerSpec::Dense {
            dim: (16, 16),
            act_fn: Some(ActFnSpec::Sigmoid { amp: 1.0 }),
        }],
        optimizer: OptimizerSpec::GradientDescent {
            learning_rate: 0.01,
        },
        seed: None,
    }
}

/// Loads the segment specification from a json file, or the default one.
pub fn load_segment(path: Option<&Path>) -> Result<SegmentSpec> {
    let Some(path) = path else {
        return Ok(default_segment());
    };

    let json = fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| {
        FacilitatorErr::InvalidConfig(format!("segment spec {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |key| vars.get(key).cloned()
    }

    #[test]
    fn reads_tcp_config_with_defaults() {
        let config = FacilitatorConfig::from_lookup(lookup(&[("PORT", "7000")])).unwrap();

        assert_eq!(config.rank(), DEFAULT_RANK);
        assert_eq!(config.server_rank(), DEFAULT_SERVER_RANK);
        assert_eq!(config.world_size(), DEFAULT_WORLD_SIZE);
        assert_eq!(
            config.backend(),
            &Backend::Tcp {
                listen: "127.0.0.1:7000".parse().unwrap()
            }
        );
    }

    #[test]
    fn tcp_requires_a_port() {
        let res = FacilitatorConfig::from_lookup(lookup(&[]));
        assert!(matches!(res, Err(FacilitatorErr::InvalidConfig(_))));
    }

    #[test]
    fn reads_memory_backend_and_ranks() {
        let vars = [
            ("BACKEND", "memory"),
            ("RANK", "2"),
            ("SERVER_RANK", "0"),
            ("WORLD_SIZE", "5"),
        ];
        let config = FacilitatorConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.backend(), &Backend::Memory);
        assert_eq!(config.peers().collect::<Vec<_>>(), vec![0, 1, 3, 4]);
        assert!(config.is_client(1) && config.is_client(4));
        assert!(!config.is_client(0) && !config.is_client(2) && !config.is_client(5));
    }

    #[test]
    fn rejects_inconsistent_ranks() {
        let cases = [(1, 2, 0), (3, 3, 0), (1, 3, 1), (0, 3, 7)];

        for (rank, world_size, server_rank) in cases {
            let res = FacilitatorConfig::new(rank, world_size, server_rank, Backend::Memory);
            assert!(matches!(res, Err(FacilitatorErr::InvalidConfig(_))));
        }
    }

    #[test]
    fn rejects_garbage_values() {
        let res = FacilitatorConfig::from_lookup(lookup(&[("PORT", "7000"), ("RANK", "one")]));
        assert!(matches!(res, Err(FacilitatorErr::InvalidConfig(_))));

        let res = FacilitatorConfig::from_lookup(lookup(&[("BACKEND", "mpi")]));
        assert!(matches!(res, Err(FacilitatorErr::InvalidConfig(_))));
    }

    #[test]
    fn loads_segment_from_file() {
        let path = env::temp_dir().join(format!("segment-{}.json", std::process::id()));
        let spec = SegmentSpec {
            seed: Some(11),
            ..default_segment()
        };
        let json = r#"{
            "layers": [{ "dense": { "dim": [16, 16], "act_fn": { "sigmoid": { "amp": 1.0 } } } }],
            "optimizer": { "gradient_descent": { "learning_rate": 0.01 } },
            "seed": 11
        }"#;
        fs::write(&path, json).unwrap();

        let loaded = load_segment(Some(&path));
        fs::remove_file(&path).unwrap();

        assert_eq!(loaded.unwrap(), spec);
        assert_eq!(load_segment(None).unwrap(), default_segment());
    }
}
