//! Deciding which slot a newly earned name goes into.
//!
//! Slots are ranked by freshness: empty slots first, then the least recently
//! modified, with the slot id breaking ties. The name is written without
//! taking the slot's lock; the claimant holding the slot picks it up through
//! its data watch.
//!
//! ## Structure
//!
//! - [`candidate`] - Shortlisting ranked name candidates and the naming
//!   budget.

pub mod candidate;

use crate::error::{CoordinationError, Result};
use crate::path::NamespaceLayout;
use crate::recipe::lock_contenders;
use crate::session::CoordinationSession;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

/// Shown as the previous holder when nobody holds the slot.
pub const UNKNOWN_HOLDER: &str = "one of our servers";

/// A slot as read for ranking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub slot: String,
    pub value: String,
    pub modified_ms: u64,
}

impl SlotSnapshot {
    fn rank_key(&self) -> (bool, u64, &str) {
        (!self.value.is_empty(), self.modified_ms, &self.slot)
    }
}

/// The slot the next name should go into.
pub fn select_slot(slots: &[SlotSnapshot]) -> Option<&SlotSnapshot> {
    slots.iter().min_by(|a, b| a.rank_key().cmp(&b.rank_key()))
}

/// All slots, best candidate for renaming first.
pub fn rank_slots(slots: &[SlotSnapshot]) -> Vec<&SlotSnapshot> {
    let mut ranked: Vec<&SlotSnapshot> = slots.iter().collect();
    ranked.sort_by(|a, b| a.rank_key().cmp(&b.rank_key()));
    ranked
}

/// Outcome of writing one name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub slot: String,
    pub name: String,
    /// Identity of the slot's current lock holder, or [`UNKNOWN_HOLDER`].
    pub previous_holder: String,
}

/// Writes names into the pool.
pub struct Assigner<S: ?Sized> {
    session: Arc<S>,
    layout: NamespaceLayout,
}

impl<S> Assigner<S>
where
    S: CoordinationSession + ?Sized,
{
    pub fn new(session: Arc<S>, layout: NamespaceLayout) -> Self {
        Self { session, layout }
    }

    /// Reads every slot's value and modification time.
    ///
    /// Slots removed while being read are left out.
    pub async fn snapshot(&self) -> Result<Vec<SlotSnapshot>> {
        let slots = self.session.children(&self.layout.root).await?;
        let mut snapshot = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.session.get(&self.layout.slot_path(&slot)).await {
                Ok((data, stat)) => snapshot.push(SlotSnapshot {
                    value: String::from_utf8_lossy(&data).trim().to_owned(),
                    modified_ms: stat.modified_ms,
                    slot,
                }),
                Err(CoordinationError::NoNode { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(snapshot)
    }

    /// Writes `name` into the best slot. `None` when the pool is empty.
    pub async fn assign(&self, name: &str) -> Result<Option<Assignment>> {
        let snapshot = self.snapshot().await?;
        let Some(target) = select_slot(&snapshot) else {
            tracing::warn!(root = %self.layout.root, %name, "no slots to assign to");
            return Ok(None);
        };

        let path = self.layout.slot_path(&target.slot);
        self.session
            .set(&path, Bytes::from(name.to_owned().into_bytes()))
            .await?;
        let previous_holder = self.previous_holder(&target.slot).await;
        tracing::info!(slot = %target.slot, %name, %previous_holder, "assigned name");

        Ok(Some(Assignment {
            slot: target.slot.clone(),
            name: name.to_owned(),
            previous_holder,
        }))
    }

    /// Assigns each name in turn, re-reading the pool before every write.
    pub async fn assign_all<I>(&self, names: I) -> Result<Vec<Assignment>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut assignments = Vec::new();
        for name in names {
            match self.assign(name.as_ref()).await? {
                Some(assignment) => assignments.push(assignment),
                None => break,
            }
        }
        Ok(assignments)
    }

    /// Identity of whoever holds `slot`.
    ///
    /// Never fails: an empty lock, an empty identity or a failed read all
    /// yield [`UNKNOWN_HOLDER`].
    pub async fn previous_holder(&self, slot: &str) -> String {
        match lock_contenders(&*self.session, &self.layout.slot_path(slot)).await {
            Ok(contenders) => contenders
                .into_iter()
                .next()
                .filter(|holder| !holder.is_empty())
                .unwrap_or_else(|| UNKNOWN_HOLDER.to_owned()),
            Err(e) => {
                tracing::debug!(%slot, error = %e, "could not read lock contenders");
                UNKNOWN_HOLDER.to_owned()
            }
        }
    }
}

/// Message template announcing a rename.
///
/// A template may hold several variants separated by a line containing only
/// `---`. Variants use `{old}` for the previous holder and `{new}` for the
/// new name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    variants: Vec<String>,
}

impl Default for Notice {
    fn default() -> Self {
        Self::parse("{old} is now known as {new}.")
    }
}

impl Notice {
    pub fn parse(template: &str) -> Self {
        let mut variants = Vec::new();
        let mut current = String::new();
        for line in template.lines() {
            if line.trim_end() == "---" {
                variants.push(current.trim().to_owned());
                current.clear();
            } else {
                current.push_str(line);
                current.push('\n');
            }
        }
        variants.push(current.trim().to_owned());
        variants.retain(|v| !v.is_empty());
        Self { variants }
    }

    pub fn variants(&self) -> usize {
        self.variants.len()
    }

    /// Renders the variant picked by the new name, so a given name always
    /// gets the same text.
    pub fn render(&self, old: &str, new: &str) -> String {
        let Some(first) = self.variants.first() else {
            return String::new();
        };
        let pick = new
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        let variant = self.variants.get(pick % self.variants.len()).unwrap_or(first);
        variant.replace("{old}", old).replace("{new}", new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::SlotLock;
    use crate::session::SessionConfig;
    use crate::session::memory::{MemoryEnsemble, MemorySession};
    use crate::time::ManualClock;
    use core::time::Duration;

    fn snap(slot: &str, value: &str, modified_ms: u64) -> SlotSnapshot {
        SlotSnapshot {
            slot: slot.to_owned(),
            value: value.to_owned(),
            modified_ms,
        }
    }

    #[test]
    fn empty_slots_beat_old_named_ones() {
        let slots = [snap("alpha", "", 900), snap("beta", "zeus", 100)];
        assert_eq!(select_slot(&slots).unwrap().slot, "alpha");
    }

    #[test]
    fn oldest_then_lowest_id_wins() {
        let slots = [
            snap("gamma", "c", 200),
            snap("beta", "b", 100),
            snap("alpha", "a", 100),
        ];
        let ranked: Vec<_> = rank_slots(&slots).into_iter().map(|s| &s.slot).collect();
        assert_eq!(ranked, ["alpha", "beta", "gamma"]);
        assert_eq!(select_slot(&slots).unwrap().slot, "alpha");
        assert!(select_slot(&[]).is_none());
    }

    #[test]
    fn selection_ignores_input_order() {
        let mut slots = vec![
            snap("a", "x", 5),
            snap("b", "", 7),
            snap("c", "", 7),
            snap("d", "y", 1),
        ];
        let first = select_slot(&slots).cloned();
        slots.reverse();
        assert_eq!(select_slot(&slots).cloned(), first);
        assert_eq!(first.unwrap().slot, "b");
    }

    #[test]
    fn notice_variants_render_placeholders() {
        let notice = Notice::parse("{old} becomes {new}\n---\n{new} replaces {old}\n");
        assert_eq!(notice.variants(), 2);
        let text = notice.render("host-a", "zeus");
        assert!(text == "host-a becomes zeus" || text == "zeus replaces host-a");
        assert_eq!(notice.render("host-a", "zeus"), text);

        assert_eq!(
            Notice::default().render(UNKNOWN_HOLDER, "zeus"),
            "one of our servers is now known as zeus."
        );
        assert_eq!(Notice::parse("").render("a", "b"), "");
    }

    fn connect(ensemble: &MemoryEnsemble) -> Arc<MemorySession> {
        Arc::new(ensemble.connect(&SessionConfig {
            connect: "memory://".to_owned(),
            credentials: None,
            session_timeout: Duration::from_secs(10),
        }))
    }

    async fn pool(clock: &ManualClock, slots: &[(&str, &str)]) -> (MemoryEnsemble, NamespaceLayout) {
        let ensemble = MemoryEnsemble::with_clock(clock.clone());
        let layout = NamespaceLayout::new("/pool", "/pool-semaphore").unwrap();
        let admin = connect(&ensemble);
        for (slot, value) in slots {
            clock.advance(10);
            let path = layout.slot_path(slot);
            admin.ensure_path(&path, &[]).await.unwrap();
            if !value.is_empty() {
                admin
                    .set(&path, Bytes::from(value.as_bytes().to_vec()))
                    .await
                    .unwrap();
            }
        }
        (ensemble, layout)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_slot_is_named_before_stale_ones() {
        let clock = ManualClock::new(1_000);
        let (ensemble, layout) = pool(&clock, &[("beta", "zeus"), ("alpha", "")]).await;
        let assigner = Assigner::new(connect(&ensemble), layout);

        clock.advance(10);
        let assignment = assigner.assign("hera").await.unwrap().unwrap();
        assert_eq!(assignment.slot, "alpha");
        assert_eq!(assignment.previous_holder, UNKNOWN_HOLDER);

        clock.advance(10);
        let assignment = assigner.assign("ares").await.unwrap().unwrap();
        assert_eq!(assignment.slot, "beta");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_is_stable_without_writes() {
        let clock = ManualClock::new(1_000);
        let (ensemble, layout) = pool(&clock, &[("a", "x"), ("b", "y"), ("c", "")]).await;
        let assigner = Assigner::new(connect(&ensemble), layout);

        let first = assigner.snapshot().await.unwrap();
        let second = assigner.snapshot().await.unwrap();
        assert_eq!(select_slot(&first), select_slot(&second));
        assert_eq!(select_slot(&first).unwrap().slot, "c");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn assign_all_spreads_names_over_the_pool() {
        let clock = ManualClock::new(1_000);
        let (ensemble, layout) = pool(&clock, &[("a", ""), ("b", ""), ("c", "")]).await;
        let session = connect(&ensemble);
        let assigner = Assigner::new(Arc::clone(&session), layout);

        let assigned = assigner.assign_all(["zeus", "hera"]).await.unwrap();
        let slots: Vec<_> = assigned.iter().map(|a| a.slot.as_str()).collect();
        assert_eq!(slots, ["a", "b"]);

        let values: Vec<_> = assigner
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(values, ["zeus", "hera", ""]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn previous_holder_is_the_lock_holder() {
        let clock = ManualClock::new(1_000);
        let (ensemble, layout) = pool(&clock, &[("alpha", "")]).await;
        let holder = SlotLock::new(connect(&ensemble), layout.slot_path("alpha"), "host-a");
        assert!(holder.try_acquire().await.unwrap());

        let assigner = Assigner::new(connect(&ensemble), layout);
        let assignment = assigner.assign("zeus").await.unwrap().unwrap();
        assert_eq!(assignment.previous_holder, "host-a");
        assert_eq!(assigner.previous_holder("missing").await, UNKNOWN_HOLDER);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_pool_assigns_nothing() {
        let clock = ManualClock::new(1_000);
        let (ensemble, layout) = pool(&clock, &[]).await;
        connect(&ensemble)
            .ensure_path(&layout.root, &[])
            .await
            .unwrap();
        let assigner = Assigner::new(connect(&ensemble), layout);
        assert_eq!(assigner.assign("zeus").await.unwrap(), None);
        assert!(assigner.assign_all(["zeus"]).await.unwrap().is_empty());
    }
}
