use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

impl Config {
    pub fn load(path: &Path) -> Self {
        let conf = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(::config::Environment::default().separator("_"))
            .build()
            .expect("unable to read configuration");
        conf.try_deserialize()
            .expect("configuration format invalid")
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct DnsConfig {
    #[serde(default = "DnsConfig::default_host")]
    pub host: IpAddr,
    #[serde(default = "DnsConfig::default_port")]
    pub port: u16,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

impl DnsConfig {
    fn default_host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
    }

    fn default_port() -> u16 {
        53
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

impl CacheConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("recursor.cache")
    }

    pub fn build(&self) -> crate::error::Result<crate::cache::Cache> {
        crate::cache::Cache::open(&self.path)
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct ResolverConfig {
    /// Root server addresses the iteration starts from.
    #[serde(default = "ResolverConfig::default_roots")]
    pub roots: Vec<IpAddr>,
    /// Cap on how long negative answers may live, seconds.
    #[serde(default = "ResolverConfig::default_negative_ttl")]
    pub negative_ttl: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            roots: Self::default_roots(),
            negative_ttl: Self::default_negative_ttl(),
        }
    }
}

impl ResolverConfig {
    fn default_roots() -> Vec<IpAddr> {
        [
            [198, 41, 0, 4],
            [199, 9, 14, 201],
            [192, 33, 4, 12],
            [199, 7, 91, 13],
            [192, 203, 230, 10],
            [192, 5, 5, 241],
            [192, 112, 36, 4],
            [198, 97, 190, 53],
            [192, 36, 148, 17],
            [192, 58, 128, 30],
            [193, 0, 14, 129],
            [199, 7, 83, 42],
            [202, 12, 27, 33],
        ]
        .into_iter()
        .map(|octets| IpAddr::V4(Ipv4Addr::from(octets)))
        .collect()
    }

    fn default_negative_ttl() -> u32 {
        900
    }

    /// Root hints paired with the conventional server names.
    pub fn root_hints(&self) -> Vec<(String, SocketAddr)> {
        self.roots
            .iter()
            .enumerate()
            .map(|(index, &addr)| {
                let letter = (b'a' + (index % 26) as u8) as char;
                (
                    format!("{letter}.root-servers.net"),
                    SocketAddr::from((addr, crate::zonecut::DNS_PORT)),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    #[test]
    fn should_default_to_port_53() {
        let config = super::Config::default();
        assert_eq!(config.dns.address().port(), 53);
        assert_eq!(config.resolver.roots.len(), 13);
        assert_eq!(config.resolver.negative_ttl, 900);
    }

    #[test]
    fn should_name_root_hints_by_letter() {
        let hints = super::ResolverConfig::default().root_hints();
        assert_eq!(hints[0].0, "a.root-servers.net");
        assert_eq!(hints[12].0, "m.root-servers.net");
    }
}
