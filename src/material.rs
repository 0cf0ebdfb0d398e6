//! Elastic constants for the deck

use serde::{Deserialize, Serialize};

use crate::error::{FeaError, FeaResult};
use crate::models::MaterialSpec;

pub const FALLBACK_POISSON_RATIO: f64 = 0.3;

/// Catalogue entry, moduli in MPa.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatalogueMaterial {
    pub name: &'static str,
    pub elastic_modulus: f64,
    pub shear_modulus: f64,
}

const CATALOGUE: &[CatalogueMaterial] = &[
    CatalogueMaterial { name: "S235", elastic_modulus: 210_000.0, shear_modulus: 81_000.0 },
    CatalogueMaterial { name: "S275", elastic_modulus: 210_000.0, shear_modulus: 81_000.0 },
    CatalogueMaterial { name: "S355", elastic_modulus: 210_000.0, shear_modulus: 81_000.0 },
    CatalogueMaterial { name: "S460", elastic_modulus: 210_000.0, shear_modulus: 81_000.0 },
    CatalogueMaterial { name: "1.4301", elastic_modulus: 200_000.0, shear_modulus: 76_900.0 },
];

pub fn lookup(name: &str) -> Option<CatalogueMaterial> {
    let name = name.trim();
    CATALOGUE
        .iter()
        .find(|m| m.name.eq_ignore_ascii_case(name))
        .copied()
}

/// Resolved E (MPa) and ν written to the `*ELASTIC` card.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ElasticConstants {
    pub elastic_modulus: f64,
    pub poisson_ratio: f64,
}

impl Default for ElasticConstants {
    fn default() -> Self {
        let steel = CATALOGUE[2];
        Self {
            elastic_modulus: steel.elastic_modulus,
            poisson_ratio: FALLBACK_POISSON_RATIO,
        }
    }
}

/// ν = E / (2G) − 1
pub fn poisson_from_moduli(elastic_modulus: f64, shear_modulus: f64) -> f64 {
    elastic_modulus / (2.0 * shear_modulus) - 1.0
}

fn is_physical(nu: f64) -> bool {
    nu.is_finite() && nu > 0.0 && nu < 0.5
}

/// Resolve elastic constants. Explicitly supplied values must be physical;
/// only catalogue and default materials fall back to ν = 0.3.
pub fn resolve(spec: &MaterialSpec) -> FeaResult<ElasticConstants> {
    match spec {
        MaterialSpec::Direct { elastic_modulus, poisson_ratio } => {
            check_modulus(*elastic_modulus)?;
            if !is_physical(*poisson_ratio) {
                return Err(FeaError::MaterialData(format!(
                    "Poisson ratio {} outside (0, 0.5)",
                    poisson_ratio
                )));
            }
            Ok(ElasticConstants {
                elastic_modulus: *elastic_modulus,
                poisson_ratio: *poisson_ratio,
            })
        }
        MaterialSpec::Explicit { elastic_modulus, shear_modulus } => {
            check_modulus(*elastic_modulus)?;
            if !(*shear_modulus > 0.0) {
                return Err(FeaError::MaterialData(format!(
                    "shear modulus must be positive, got {}",
                    shear_modulus
                )));
            }
            let nu = poisson_from_moduli(*elastic_modulus, *shear_modulus);
            if !is_physical(nu) {
                return Err(FeaError::MaterialData(format!(
                    "E={} and G={} give Poisson ratio {:.4} outside (0, 0.5)",
                    elastic_modulus, shear_modulus, nu
                )));
            }
            Ok(ElasticConstants {
                elastic_modulus: *elastic_modulus,
                poisson_ratio: nu,
            })
        }
        MaterialSpec::Incomplete {
            elastic_modulus,
            shear_modulus,
            poisson_ratio,
        } => Err(FeaError::MaterialData(format!(
            "elastic constants need E with G or E with Poisson ratio, got E={:?}, G={:?}, nu={:?}",
            elastic_modulus, shear_modulus, poisson_ratio
        ))),
        MaterialSpec::Catalogue { name } => match lookup(name) {
            Some(m) => {
                let mut nu = poisson_from_moduli(m.elastic_modulus, m.shear_modulus);
                if !is_physical(nu) {
                    tracing::warn!(
                        "Catalogue material {} gives Poisson ratio {:.4}; using {}",
                        m.name,
                        nu,
                        FALLBACK_POISSON_RATIO
                    );
                    nu = FALLBACK_POISSON_RATIO;
                }
                Ok(ElasticConstants {
                    elastic_modulus: m.elastic_modulus,
                    poisson_ratio: nu,
                })
            }
            None => {
                tracing::warn!("Material '{}' not in catalogue; using default steel", name);
                Ok(ElasticConstants::default())
            }
        },
        MaterialSpec::Default => Ok(ElasticConstants::default()),
    }
}

fn check_modulus(e: f64) -> FeaResult<()> {
    if e.is_finite() && e > 0.0 {
        Ok(())
    } else {
        Err(FeaError::MaterialData(format!(
            "elastic modulus must be positive, got {}",
            e
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_moduli_derive_poisson() {
        let c = resolve(&MaterialSpec::Explicit {
            elastic_modulus: 210_000.0,
            shear_modulus: 81_000.0,
        })
        .unwrap();
        assert!((c.poisson_ratio - 0.296296).abs() < 1e-5);
    }

    #[test]
    fn test_explicit_out_of_range_is_error() {
        let err = resolve(&MaterialSpec::Explicit {
            elastic_modulus: 210_000.0,
            shear_modulus: 50_000.0,
        });
        assert!(matches!(err, Err(FeaError::MaterialData(_))));
    }

    #[test]
    fn test_incomplete_constants_are_rejected() {
        for spec in [
            MaterialSpec::Incomplete {
                elastic_modulus: Some(70_000.0),
                shear_modulus: None,
                poisson_ratio: None,
            },
            MaterialSpec::Incomplete {
                elastic_modulus: None,
                shear_modulus: Some(26_000.0),
                poisson_ratio: None,
            },
        ] {
            assert!(matches!(resolve(&spec), Err(FeaError::MaterialData(_))));
        }
    }

    #[test]
    fn test_catalogue_lookup_is_case_insensitive() {
        let c = resolve(&MaterialSpec::Catalogue { name: "s355".into() }).unwrap();
        assert_eq!(c.elastic_modulus, 210_000.0);
        assert!(c.poisson_ratio > 0.29 && c.poisson_ratio < 0.3);
        assert_eq!(resolve(&MaterialSpec::Default).unwrap().poisson_ratio, 0.3);
    }
}
