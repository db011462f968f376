//! Assignment diffing
//!
//! Turns the previous and target assignments into the minimal list of
//! controller operations.
//!
//! # Rules
//!
//! | Previous | Target | Operation |
//! |----------|--------|-----------|
//! | absent / empty | non-empty | `Bind` |
//! | non-empty | different non-empty | `ChangeFeatures` |
//! | non-empty | absent / empty | `Unbind` |
//! | equal | equal | nothing, unless a held slot changed subscription or the package must be rebound |
//!
//! Operations run in release order so a pair is never held by two
//! controllers: unbinds, then changes that give pairs up, then changes that
//! only add or keep pairs, then binds.

use crate::types::{describe, Assignment, ComponentName, FeatureSet, PackageName, SlotId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// One lifecycle call against a package's controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerOp {
    Bind {
        component: ComponentName,
        features: FeatureSet,
    },
    ChangeFeatures {
        component: ComponentName,
        features: FeatureSet,
    },
    Unbind {
        package: PackageName,
    },
}

impl ControllerOp {
    pub fn package(&self) -> &str {
        match self {
            Self::Bind { component, .. } | Self::ChangeFeatures { component, .. } => {
                &component.package
            }
            Self::Unbind { package } => package,
        }
    }
}

impl fmt::Display for ControllerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind {
                component,
                features,
            } => write!(f, "bind {} {}", component, describe(features)),
            Self::ChangeFeatures {
                component,
                features,
            } => write!(f, "change {} {}", component, describe(features)),
            Self::Unbind { package } => write!(f, "unbind {}", package),
        }
    }
}

/// Extra reasons to touch a package whose set did not change.
#[derive(Debug, Clone, Default)]
pub struct DiffHints {
    /// Slots whose subscription changed since the last pass
    pub resubscribed: BTreeSet<SlotId>,
    /// Packages whose controller must be recreated (component identity changed)
    pub rebind: BTreeSet<PackageName>,
}

/// Compute the operations that move `previous` to `target`.
///
/// `components` maps every package in `target` to the component to bind.
pub fn diff_assignments(
    previous: &Assignment,
    target: &Assignment,
    components: &BTreeMap<PackageName, ComponentName>,
    hints: &DiffHints,
) -> Vec<ControllerOp> {
    // (rank, op); the sort below is stable so ties keep package order
    let mut ops: Vec<(u8, ControllerOp)> = Vec::new();

    for (package, old) in previous {
        let still_owns = target.get(package).is_some_and(|set| !set.is_empty());
        if !old.is_empty() && !still_owns {
            ops.push((
                0,
                ControllerOp::Unbind {
                    package: package.clone(),
                },
            ));
        }
    }

    for (package, features) in target {
        if features.is_empty() {
            continue;
        }
        let Some(component) = components.get(package) else {
            warn!("No component known for {}, skipping", package);
            continue;
        };
        let old = previous.get(package).filter(|set| !set.is_empty());

        let op = match old {
            None => Some((
                3,
                ControllerOp::Bind {
                    component: component.clone(),
                    features: features.clone(),
                },
            )),
            Some(old)
                if old != features
                    || hints.rebind.contains(package)
                    || features.iter().any(|p| hints.resubscribed.contains(&p.slot)) =>
            {
                let releases = old.difference(features).next().is_some();
                Some((
                    if releases { 1 } else { 2 },
                    ControllerOp::ChangeFeatures {
                        component: component.clone(),
                        features: features.clone(),
                    },
                ))
            }
            Some(_) => None,
        };
        ops.extend(op);
    }

    ops.sort_by_key(|(rank, _)| *rank);
    ops.into_iter().map(|(_, op)| op).collect()
}
