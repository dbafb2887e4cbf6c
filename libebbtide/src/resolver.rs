//! Filter and action resolution
//!
//! [`resolve`] decides what should happen to a single post under a run's
//! [`Criteria`]. It never performs the action and never looks at `dry_run`;
//! the engine owns both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::criteria::{Action, Criteria};
use crate::types::{Post, PostKind};

/// What the engine should do with one post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Not old enough to qualify
    Keep,
    /// Protected by a preserve rule
    Preserve,
    Delete,
    Unlike,
    Unshare,
}

impl Disposition {
    /// The connector action this disposition calls for, if any
    pub fn action(self) -> Option<Action> {
        match self {
            Disposition::Delete => Some(Action::Delete),
            Disposition::Unlike => Some(Action::Unlike),
            Disposition::Unshare => Some(Action::Unshare),
            Disposition::Keep | Disposition::Preserve => None,
        }
    }
}

impl From<Action> for Disposition {
    fn from(action: Action) -> Self {
        match action {
            Action::Delete => Disposition::Delete,
            Action::Unlike => Disposition::Unlike,
            Action::Unshare => Disposition::Unshare,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Disposition::Keep => "keep",
            Disposition::Preserve => "preserve",
            Disposition::Delete => "delete",
            Disposition::Unlike => "unlike",
            Disposition::Unshare => "unshare",
        };
        f.write_str(s)
    }
}

/// Outcome of resolving one post
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub disposition: Disposition,
    /// A configured age/date threshold (not a preserve rule) put this post
    /// past the cut-off. On a newest-first timeline everything after it is
    /// at least as old.
    pub threshold_crossed: bool,
}

/// Resolve the disposition of `post` under `criteria` at time `now`
pub fn resolve(post: &Post, criteria: &Criteria, now: DateTime<Utc>) -> Resolution {
    if criteria.preserve_pinned && post.pinned {
        return preserved();
    }

    if criteria.preserve_self_like && post.kind == PostKind::Like && post.self_liked {
        return preserved();
    }

    if !is_old(post, criteria, now) {
        return Resolution {
            disposition: Disposition::Keep,
            threshold_crossed: false,
        };
    }

    Resolution {
        disposition: criteria.action.for_kind(post.kind).into(),
        threshold_crossed: criteria.has_threshold(),
    }
}

fn preserved() -> Resolution {
    Resolution {
        disposition: Disposition::Preserve,
        threshold_crossed: false,
    }
}

/// Old means past either configured threshold; with none configured every
/// post is old.
fn is_old(post: &Post, criteria: &Criteria, now: DateTime<Utc>) -> bool {
    if !criteria.has_threshold() {
        return true;
    }

    let past_max_age = criteria
        .max_age
        .is_some_and(|max_age| now.signed_duration_since(post.created_at) > max_age);

    let before_cutoff = criteria
        .before_date
        .is_some_and(|before| post.created_at < before);

    past_max_age || before_cutoff
}
