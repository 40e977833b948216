//! Weighted backend selection.
//!
//! A group is picked with probability proportional to its weight among the
//! active groups of a port, then a server is picked uniformly from it.

use rand::Rng;
use thiserror::Error;

use super::registry::{Group, GroupTable};

/// The selector could not pick a server even though the table had active groups.
///
/// Both variants are invariant violations, not routing outcomes: callers log
/// them loudly and treat the connection as having no route.
#[derive(Debug, Error)]
pub enum SelectError {
    /// The cumulative walk ended without reaching the draw.
    #[error("no group selected for draw {draw} with total weight {total_weight}")]
    NoGroupSelected {
        draw: f64,
        total_weight: f64,
        groups: Vec<(String, f64)>,
    },

    /// The chosen group had no servers.
    #[error("group {group} has no servers")]
    EmptyGroup { group: String },
}

/// Pick a backend address from a port's groups.
///
/// Returns `Ok(None)` when no group is active.
pub fn select_server<'a, R>(groups: &'a GroupTable, rng: &mut R) -> Result<Option<&'a str>, SelectError>
where
    R: Rng + ?Sized,
{
    let active: Vec<(&'a String, &'a Group)> =
        groups.iter().filter(|(_, group)| group.is_active()).collect();

    if active.is_empty() {
        return Ok(None);
    }

    let total_weight: f64 = active.iter().map(|(_, group)| group.weight).sum();
    let draw = rng.random::<f64>() * total_weight;

    let mut cumulative = 0.0;
    let mut selected = None;
    for (name, group) in &active {
        cumulative += group.weight;
        if draw <= cumulative {
            selected = Some((*name, *group));
            break;
        }
    }

    let Some((name, group)) = selected else {
        return Err(SelectError::NoGroupSelected {
            draw,
            total_weight,
            groups: active
                .iter()
                .map(|(name, group)| ((*name).clone(), group.weight))
                .collect(),
        });
    };

    if group.servers.is_empty() {
        return Err(SelectError::EmptyGroup {
            group: name.clone(),
        });
    }

    let index = rng.random_range(0..group.servers.len());
    Ok(Some(group.servers[index].as_str()))
}
