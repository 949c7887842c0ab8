//! Linking devices to each other by remotely pressing their set buttons.
//!
//! A link has two halves: a controller record in the controller's database
//! and a responder record in the responder's. Devices write both halves
//! themselves when the controller is put into linking mode and the responder
//! follows shortly after, so every operation here is a sequence of linking
//! mode changes separated by settling delays.

use std::time::Duration;

use async_trait::async_trait;
use futures_timer::Delay;
use log::debug;

use crate::device::Linkable;
use crate::error::*;
use crate::linkdb::{find_link, Group, LinkRecord};
use crate::message::Address;

/// Time a controller needs in linking mode before the responder joins.
pub const CONTROLLER_SETTLE: Duration = Duration::from_secs(2);

/// Time a responder needs to finish linking before modes are exited.
pub const RESPONDER_SETTLE: Duration = Duration::from_secs(1);

/// Waits between linking steps.
#[async_trait]
pub trait Sleep: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Waits in real time.
pub struct RealTime;

#[async_trait]
impl Sleep for RealTime {
    async fn sleep(&self, duration: Duration) {
        Delay::new(duration).await
    }
}

/// Runs linking operations between [Linkable] devices.
pub struct Linker {
    sleep: Box<dyn Sleep>,
    controller_settle: Duration,
    responder_settle: Duration,
}

impl Default for Linker {
    fn default() -> Self {
        Linker::with_sleep(RealTime)
    }
}

impl Linker {
    pub fn new() -> Linker {
        Linker::default()
    }

    pub fn with_sleep(sleep: impl Sleep + 'static) -> Linker {
        Linker {
            sleep: Box::new(sleep),
            controller_settle: CONTROLLER_SETTLE,
            responder_settle: RESPONDER_SETTLE,
        }
    }

    pub fn with_settle(mut self, controller: Duration, responder: Duration) -> Linker {
        self.controller_settle = controller;
        self.responder_settle = responder;
        self
    }

    /// Links `controller` to `responder` for `group`.
    ///
    /// Fails with [Error::AlreadyLinked] if both halves already exist. A
    /// lone half is taken to be stale and removed from the device holding
    /// it before the link is made again.
    pub async fn link(
        &self,
        group: Group,
        controller: &dyn Linkable,
        responder: &dyn Linkable,
    ) -> Result<(), Error> {
        debug!("Looking for existing links");
        let controller_link =
            find_link_record(controller, true, responder.address(), group).await?;
        let responder_link =
            find_link_record(responder, false, controller.address(), group).await?;

        match (controller_link, responder_link) {
            (Some(_), Some(_)) => return Err(Error::AlreadyLinked),
            (Some(link), None) => {
                debug!("Controller link already exists, deleting it");
                controller.remove_link(&link).await?;
            }
            (None, Some(link)) => {
                debug!("Responder link already exists, deleting it");
                responder.remove_link(&link).await?;
            }
            (None, None) => (),
        }

        self.force_link(group, controller, responder).await
    }

    /// Links `controller` to `responder` without looking at their databases.
    pub async fn force_link(
        &self,
        group: Group,
        controller: &dyn Linkable,
        responder: &dyn Linkable,
    ) -> Result<(), Error> {
        debug!(
            "Linking {} to {} for group {}",
            controller.address(),
            responder.address(),
            group
        );
        let entered = controller.enter_linking_mode(group).await;
        self.press_responder(group, entered, controller, responder)
            .await
    }

    /// Links `a` and `b` as controller and responder of each other. Halves
    /// that already exist are left alone, so this can be repeated safely.
    pub async fn cross_link(
        &self,
        group: Group,
        a: &dyn Linkable,
        b: &dyn Linkable,
    ) -> Result<(), Error> {
        match self.link(group, a, b).await {
            Ok(()) | Err(Error::AlreadyLinked) => (),
            Err(e) => return Err(e),
        }

        match self.link(group, b, a).await {
            Ok(()) | Err(Error::AlreadyLinked) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cross links every pair of `devices`, building a virtual N-way group.
    pub async fn cross_link_all(
        &self,
        group: Group,
        devices: &[&dyn Linkable],
    ) -> Result<(), Error> {
        for (i, a) in devices.iter().enumerate() {
            for b in &devices[i + 1..] {
                if a.address() != b.address() {
                    self.cross_link(group, *a, *b).await?;
                }
            }
        }
        Ok(())
    }

    /// Removes the link from `controller` to `responder` for `group`. The
    /// responder confirms the removal by entering linking mode.
    pub async fn unlink(
        &self,
        group: Group,
        controller: &dyn Linkable,
        responder: &dyn Linkable,
    ) -> Result<(), Error> {
        debug!(
            "Unlinking {} from {} for group {}",
            responder.address(),
            controller.address(),
            group
        );
        let entered = controller.enter_unlinking_mode(group).await;
        self.press_responder(group, entered, controller, responder)
            .await
    }

    /// Removes every link between `controller` and `responder` that
    /// `controller` knows of, in either direction.
    pub async fn unlink_all(
        &self,
        controller: &dyn Linkable,
        responder: &dyn Linkable,
    ) -> Result<(), Error> {
        let links = controller.links().await?;

        let mut done: Vec<(bool, Group)> = Vec::new();
        for link in links
            .iter()
            .filter(|link| link.flags.in_use() && link.address == responder.address())
        {
            let key = (link.flags.controller(), link.group);
            if done.contains(&key) {
                continue;
            }
            done.push(key);

            if link.flags.controller() {
                self.unlink(link.group, controller, responder).await?;
            } else {
                self.unlink(link.group, responder, controller).await?;
            }
        }
        Ok(())
    }

    /// The second half of a set-button sequence. The controller has just
    /// been asked to enter a mode; the responder follows if that worked, and
    /// both leave linking mode whatever happened. The first error wins.
    async fn press_responder(
        &self,
        group: Group,
        entered: Result<(), Error>,
        controller: &dyn Linkable,
        responder: &dyn Linkable,
    ) -> Result<(), Error> {
        self.sleep.sleep(self.controller_settle).await;

        let (result, responder_entered) = match entered {
            Ok(()) => (responder.enter_linking_mode(group).await, true),
            Err(e) => (Err(e), false),
        };

        self.sleep.sleep(self.responder_settle).await;

        let responder_exit = if responder_entered {
            responder.exit_linking_mode().await
        } else {
            Ok(())
        };
        let controller_exit = controller.exit_linking_mode().await;

        result.and(responder_exit).and(controller_exit)
    }
}

/// Records in `device` that are equivalent to an earlier record. Each
/// duplicate is reported once.
pub async fn find_duplicate_links(device: &dyn Linkable) -> Result<Vec<LinkRecord>, Error> {
    let links = device.links().await?;
    Ok(duplicates(&links))
}

fn duplicates(links: &[LinkRecord]) -> Vec<LinkRecord> {
    links
        .iter()
        .enumerate()
        .filter(|(i, link)| links[..*i].iter().any(|earlier| earlier.equivalent(link)))
        .map(|(_, link)| *link)
        .collect()
}

/// Reads `device`'s database and returns the first in-use record with the
/// given role, address and group.
pub async fn find_link_record(
    device: &dyn Linkable,
    controller: bool,
    address: Address,
    group: Group,
) -> Result<Option<LinkRecord>, Error> {
    let links = device.links().await?;
    Ok(find_link(&links, controller, address, group).copied())
}
