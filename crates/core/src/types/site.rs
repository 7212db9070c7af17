//! MercadoLibre marketplace sites.
//!
//! Every ML account belongs to one site (country marketplace). The site
//! decides which regional domain hosts the OAuth consent page.

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a site id is not one we support.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported MercadoLibre site: {0}")]
pub struct MlSiteError(pub String);

/// A MercadoLibre site, identified by its three-letter site id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum MlSite {
    /// Argentina.
    #[default]
    Mla,
    /// Brazil (Mercado Livre).
    Mlb,
    /// Mexico.
    Mlm,
    /// Chile.
    Mlc,
    /// Colombia.
    Mco,
    /// Uruguay.
    Mlu,
    /// Peru.
    Mpe,
}

impl MlSite {
    /// All supported sites.
    pub const ALL: [Self; 7] = [
        Self::Mla,
        Self::Mlb,
        Self::Mlm,
        Self::Mlc,
        Self::Mco,
        Self::Mlu,
        Self::Mpe,
    ];

    /// The site id as used by the ML API (e.g. `MLA`).
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Mla => "MLA",
            Self::Mlb => "MLB",
            Self::Mlm => "MLM",
            Self::Mlc => "MLC",
            Self::Mco => "MCO",
            Self::Mlu => "MLU",
            Self::Mpe => "MPE",
        }
    }

    /// Base URL of the regional authorization server.
    #[must_use]
    pub const fn auth_base_url(self) -> &'static str {
        match self {
            Self::Mla => "https://auth.mercadolibre.com.ar",
            Self::Mlb => "https://auth.mercadolivre.com.br",
            Self::Mlm => "https://auth.mercadolibre.com.mx",
            Self::Mlc => "https://auth.mercadolibre.cl",
            Self::Mco => "https://auth.mercadolibre.com.co",
            Self::Mlu => "https://auth.mercadolibre.com.uy",
            Self::Mpe => "https://auth.mercadolibre.com.pe",
        }
    }
}

impl fmt::Display for MlSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for MlSite {
    type Err = MlSiteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|site| site.id() == upper)
            .ok_or_else(|| MlSiteError(s.to_owned()))
    }
}

impl TryFrom<String> for MlSite {
    type Error = MlSiteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MlSite> for String {
    fn from(site: MlSite) -> Self {
        site.id().to_owned()
    }
}

#[cfg(feature = "postgres")]
impl sqlx::Type<sqlx::Postgres> for MlSite {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

#[cfg(feature = "postgres")]
impl<'r> sqlx::Decode<'r, sqlx::Postgres> for MlSite {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(s.parse()?)
    }
}

#[cfg(feature = "postgres")]
impl sqlx::Encode<'_, sqlx::Postgres> for MlSite {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.id(), buf)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("mlb".parse::<MlSite>().unwrap(), MlSite::Mlb);
        assert_eq!(" MLA ".parse::<MlSite>().unwrap(), MlSite::Mla);
        assert_eq!(
            "MLX".parse::<MlSite>(),
            Err(MlSiteError("MLX".to_string()))
        );
    }

    #[test]
    fn test_brazil_uses_mercadolivre_domain() {
        assert_eq!(
            MlSite::Mlb.auth_base_url(),
            "https://auth.mercadolivre.com.br"
        );
    }

    #[test]
    fn test_serde_uses_site_id() {
        assert_eq!(serde_json::to_string(&MlSite::Mco).unwrap(), "\"MCO\"");
        let site: MlSite = serde_json::from_str("\"MLM\"").unwrap();
        assert_eq!(site, MlSite::Mlm);
        assert!(serde_json::from_str::<MlSite>("\"ZZZ\"").is_err());
    }

    #[test]
    fn test_every_site_round_trips_through_id() {
        for site in MlSite::ALL {
            assert_eq!(site.id().parse::<MlSite>().unwrap(), site);
        }
    }
}
