//! The high-level panel handle: capability lookup, partition/zone
//! enumeration, control operations, and the event-router wiring that
//! keeps the inventory current.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::connection::{Connection, RouterMessage};
use crate::error::{OperationErrorKind, RiscoError, RiscoResult};
use crate::events::{Classified, EventRouter, HandlerId};
use crate::partition::{self, Partition};
use crate::zone::{self, Zone};

/// Per-model limits, resolved once during [`Panel::connect`] from the
/// panel-type string and (for `RP*` models) the firmware version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub model: String,
    pub max_zones: u16,
    pub max_partitions: u16,
    pub max_outputs: u16,
    pub firmware: String,
}

impl Capabilities {
    fn new(
        model: &str,
        max_zones: u16,
        max_partitions: u16,
        max_outputs: u16,
        firmware: &str,
    ) -> Self {
        Self {
            model: model.to_string(),
            max_zones,
            max_partitions,
            max_outputs,
            firmware: firmware.to_string(),
        }
    }

    /// `panel_type` is the raw `PNLCNF` response (leading token before
    /// `:` carries the model code); `firmware` is the raw `FSVER?`
    /// response, or empty for non-`RP*` models.
    pub(crate) fn lookup(panel_type: &str, firmware: &str) -> Self {
        let model_code = panel_type.split(':').next().unwrap_or(panel_type);
        let firmware = firmware.split_whitespace().next().unwrap_or(firmware);

        if model_code.starts_with("RW032") {
            Capabilities::new("Agility 4", 32, 3, 4, firmware)
        } else if model_code.starts_with("RW132") {
            Capabilities::new("Agility", 36, 3, 4, firmware)
        } else if model_code.starts_with("RW232") {
            Capabilities::new("WiComm", 36, 3, 4, firmware)
        } else if model_code.starts_with("RW332") {
            Capabilities::new("WiCommPro", 36, 3, 4, firmware)
        } else if model_code.starts_with("RP432MP") {
            Capabilities::new("LightSys+", 512, 32, 196, firmware)
        } else if model_code.starts_with("RP432") {
            let major = parse_firmware(firmware).and_then(|v| v.first().copied());
            let (max_zones, max_outputs) = match major {
                Some(m) if m >= 3 => (50, 32),
                _ => (32, 14),
            };
            Capabilities::new("LightSys", max_zones, 4, max_outputs, firmware)
        } else if model_code.starts_with("RP512") {
            let bumped = parse_firmware(firmware)
                .map(|tuple| firmware_at_least(&tuple, &[1, 2, 0, 7]))
                .unwrap_or(false);
            let max_zones = if bumped { 128 } else { 64 };
            Capabilities::new("ProsysPlus/GTPlus", max_zones, 32, 262, firmware)
        } else {
            tracing::warn!(model_code, "unrecognised panel type, using zero capacity");
            Capabilities::new(model_code, 0, 0, 0, firmware)
        }
    }
}

fn parse_firmware(firmware: &str) -> Option<Vec<u32>> {
    if firmware.is_empty() {
        return None;
    }
    firmware
        .split('.')
        .map(|part| part.parse::<u32>().ok())
        .collect()
}

/// Lexicographic dotted-tuple comparison, missing trailing components
/// treated as `0`.
fn firmware_at_least(firmware: &[u32], threshold: &[u32]) -> bool {
    for i in 0..firmware.len().max(threshold.len()) {
        let f = firmware.get(i).copied().unwrap_or(0);
        let t = threshold.get(i).copied().unwrap_or(0);
        match f.cmp(&t) {
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Equal => continue,
        }
    }
    true
}

/// Either letter form (`A`..`D`) or 1-based integer form of a group
/// selector, accepted interchangeably by [`Panel::group_arm`].
#[derive(Debug, Clone, Copy)]
pub enum GroupSelector {
    Letter(char),
    Number(u8),
}

impl From<char> for GroupSelector {
    fn from(c: char) -> Self {
        GroupSelector::Letter(c)
    }
}

impl From<u8> for GroupSelector {
    fn from(n: u8) -> Self {
        GroupSelector::Number(n)
    }
}

impl GroupSelector {
    fn resolve(self) -> RiscoResult<u8> {
        let invalid = || {
            RiscoError::Operation(OperationErrorKind::Refused(
                "group selector out of range A-D / 1-4".to_string(),
            ))
        };
        match self {
            GroupSelector::Number(n) if (1..=4).contains(&n) => Ok(n),
            GroupSelector::Letter(c) => match c.to_ascii_uppercase() {
                'A' => Ok(1),
                'B' => Ok(2),
                'C' => Ok(3),
                'D' => Ok(4),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

/// The connected panel: inventory, capabilities, and control surface.
pub struct Panel {
    capabilities: Capabilities,
    id: String,
    connection: Arc<Connection>,
    partitions: Arc<DashMap<u16, Partition>>,
    zones: Arc<DashMap<u16, Zone>>,
    events: EventRouter,
}

impl Panel {
    /// Run the full handshake, discover capabilities, and enumerate
    /// partitions and zones. See §4.5.
    pub async fn connect(host: &str, port: u16, code: &str, config: Config) -> RiscoResult<Self> {
        let (connection, events_rx) = Connection::connect(host, port, code, &config).await?;
        let connection = Arc::new(connection);

        let panel_type = connection.send_result("PNLCNF").await?;
        let firmware = if panel_type.starts_with("RP") {
            connection.send_result("FSVER?").await.unwrap_or_default()
        } else {
            String::new()
        };
        let capabilities = Capabilities::lookup(&panel_type, &firmware);
        let id = connection.send_result("PNLSERD").await?;

        let partitions = Arc::new(DashMap::new());
        let zones = Arc::new(DashMap::new());

        tokio::try_join!(
            enumerate_partitions(&connection, &partitions, capabilities.max_partitions),
            enumerate_zones(&connection, &zones, capabilities.max_zones),
        )?;

        let events = EventRouter::new();
        let panel = Self {
            capabilities,
            id,
            connection,
            partitions,
            zones,
            events,
        };
        panel.spawn_event_loop(events_rx);
        Ok(panel)
    }

    fn spawn_event_loop(
        &self,
        mut events_rx: tokio::sync::mpsc::UnboundedReceiver<RouterMessage>,
    ) {
        let partitions = self.partitions.clone();
        let zones = self.zones.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(message) = events_rx.recv().await {
                match message {
                    RouterMessage::Push(payload) => {
                        dispatch_push(&partitions, &zones, &events, &payload);
                    }
                    RouterMessage::Error(error) => events.dispatch_error(&error),
                }
            }
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.partitions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.zones.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub async fn arm(&self, partition_id: u16) -> RiscoResult<()> {
        self.send_ack_expect(&format!("ARM={partition_id}")).await
    }

    pub async fn disarm(&self, partition_id: u16) -> RiscoResult<()> {
        self.send_ack_expect(&format!("DISARM={partition_id}"))
            .await
    }

    pub async fn partial_arm(&self, partition_id: u16) -> RiscoResult<()> {
        self.send_ack_expect(&format!("STAY={partition_id}")).await
    }

    pub async fn group_arm(
        &self,
        partition_id: u16,
        group: impl Into<GroupSelector>,
    ) -> RiscoResult<()> {
        let group = group.into().resolve()?;
        self.send_ack_expect(&format!("GARM*{group}={partition_id}"))
            .await
    }

    /// Sends `ZBYPAS={zone}` only when the zone's cached bypass state
    /// disagrees with `bypass`.
    pub async fn bypass_zone(&self, zone_id: u16, bypass: bool) -> RiscoResult<()> {
        use crate::zone::ZoneOps;
        let currently_bypassed = self.zones.get(&zone_id).map(|z| z.bypassed());
        if currently_bypassed == Some(bypass) {
            return Ok(());
        }
        self.send_ack_expect(&format!("ZBYPAS={zone_id}")).await?;
        if let Some(mut zone) = self.zones.get_mut(&zone_id) {
            let toggled = if bypass {
                format!("{}Y", zone.status)
            } else {
                zone.status.replace('Y', "")
            };
            zone.update_status(toggled);
        }
        Ok(())
    }

    async fn send_ack_expect(&self, command: &str) -> RiscoResult<()> {
        if self.connection.send_ack(command).await? {
            Ok(())
        } else {
            Err(RiscoError::Operation(OperationErrorKind::Refused(
                command.to_string(),
            )))
        }
    }

    pub fn add_zone_handler(&self, handler: impl Fn(Zone) + Send + Sync + 'static) -> HandlerId {
        self.events.add_zone_handler(handler)
    }

    pub fn add_partition_handler(
        &self,
        handler: impl Fn(Partition) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.add_partition_handler(handler)
    }

    pub fn add_event_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> HandlerId {
        self.events.add_event_handler(handler)
    }

    pub fn add_default_handler(
        &self,
        handler: impl Fn(&str, &str, &[String]) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.add_default_handler(handler)
    }

    pub fn add_error_handler(
        &self,
        handler: impl Fn(&RiscoError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.events.add_error_handler(handler)
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.events.remove_handler(id)
    }
}

fn dispatch_push(
    partitions: &DashMap<u16, Partition>,
    zones: &DashMap<u16, Zone>,
    events: &EventRouter,
    payload: &str,
) {
    match crate::events::classify(payload) {
        Classified::Clock => {}
        Classified::Event(text) => events.dispatch_event(&text),
        Classified::ZoneStatus { zone_id, status } => {
            if let Some(mut zone) = zones.get_mut(&zone_id) {
                zone.update_status(status);
                let snapshot = zone.clone();
                drop(zone);
                events.dispatch_zone(snapshot);
            }
        }
        Classified::PartitionStatus {
            partition_id,
            status,
        } => {
            if let Some(mut partition) = partitions.get_mut(&partition_id) {
                partition.update_status(status);
                let snapshot = partition.clone();
                drop(partition);
                events.dispatch_partition(snapshot);
            }
        }
        Classified::Default {
            command,
            result,
            params,
        } => events.dispatch_default(&command, &result, &params),
    }
}

async fn enumerate_partitions(
    connection: &Arc<Connection>,
    partitions: &Arc<DashMap<u16, Partition>>,
    max_partitions: u16,
) -> RiscoResult<()> {
    let mut set = JoinSet::new();
    for id in 1..=max_partitions {
        let connection = connection.clone();
        let partitions = partitions.clone();
        set.spawn(async move { enumerate_one_partition(&connection, &partitions, id).await });
    }
    drain(set).await
}

async fn enumerate_one_partition(
    connection: &Connection,
    partitions: &DashMap<u16, Partition>,
    id: u16,
) -> RiscoResult<()> {
    let status = match connection.send_result(&format!("PSTT{id}?")).await {
        Ok(status) => status,
        Err(RiscoError::Operation(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    if !partition::is_enumerable(&status) {
        return Ok(());
    }
    let name = connection
        .send_result(&format!("PLBL{id}?"))
        .await
        .unwrap_or_default();
    partitions.insert(id, Partition::new(id, name, status));
    Ok(())
}

async fn enumerate_zones(
    connection: &Arc<Connection>,
    zones: &Arc<DashMap<u16, Zone>>,
    max_zones: u16,
) -> RiscoResult<()> {
    let mut set = JoinSet::new();
    for id in 1..=max_zones {
        let connection = connection.clone();
        let zones = zones.clone();
        set.spawn(async move { enumerate_one_zone(&connection, &zones, id).await });
    }
    drain(set).await
}

async fn enumerate_one_zone(
    connection: &Connection,
    zones: &DashMap<u16, Zone>,
    id: u16,
) -> RiscoResult<()> {
    let zone_type = match connection.send_result(&format!("ZTYPE*{id}?")).await {
        Ok(v) => v.trim().parse::<i32>().unwrap_or(0),
        Err(RiscoError::Operation(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    let technology = match connection.send_result(&format!("ZLNKTYP{id}?")).await {
        Ok(v) => v.trim().chars().next().unwrap_or('N'),
        Err(RiscoError::Operation(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    let status = match connection.send_result(&format!("ZSTT*{id}?")).await {
        Ok(v) => v,
        Err(RiscoError::Operation(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    if !zone::is_enumerable(zone_type, technology, &status) {
        return Ok(());
    }

    let name = connection
        .send_result(&format!("ZLBL*{id}?"))
        .await
        .unwrap_or_default();
    let partitions_hex = connection
        .send_result(&format!("ZPART&*{id}?"))
        .await
        .unwrap_or_default();
    let groups_hex = connection
        .send_result(&format!("ZAREA&*{id}?"))
        .await
        .unwrap_or_default();
    let partitions_bitset = zone::decode_partitions_hex(partitions_hex.trim());
    let groups_mask = u32::from_str_radix(groups_hex.trim(), 16).unwrap_or(0);

    zones.insert(
        id,
        Zone::new(
            id,
            name,
            zone_type,
            status,
            partitions_bitset,
            groups_mask,
            technology,
        ),
    );
    Ok(())
}

/// Drain a [`JoinSet`] of per-id enumeration tasks: a per-object
/// `Operation` error was already swallowed by the task itself, so the
/// only thing left to see here is a connection-level error, which
/// aborts whatever's still outstanding.
async fn drain(mut set: JoinSet<RiscoResult<()>>) -> RiscoResult<()> {
    let mut first_error = None;
    while let Some(result) = set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                    set.abort_all();
                }
            }
            Err(_join_error) => {}
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rw_series_lookup_matches_fixed_table() {
        let caps = Capabilities::lookup("RW032:Agility", "");
        assert_eq!(caps.model, "Agility 4");
        assert_eq!(caps.max_zones, 32);
        assert_eq!(caps.max_partitions, 3);
    }

    #[test]
    fn rp432_bumps_zone_and_output_count_at_firmware_major_3() {
        let low = Capabilities::lookup("RP432:LightSys", "2.9.0.0");
        assert_eq!(low.max_zones, 32);
        assert_eq!(low.max_outputs, 14);

        let high = Capabilities::lookup("RP432:LightSys", "3.0.0.0");
        assert_eq!(high.max_zones, 50);
        assert_eq!(high.max_outputs, 32);
    }

    #[test]
    fn rp432mp_is_matched_before_the_shorter_rp432_prefix() {
        let caps = Capabilities::lookup("RP432MP:LightSysPlus", "1.0.0.0");
        assert_eq!(caps.model, "LightSys+");
        assert_eq!(caps.max_zones, 512);
    }

    #[test]
    fn rp512_bumps_at_exact_threshold_inclusive() {
        let below = Capabilities::lookup("RP512:ProsysPlus", "1.2.0.6");
        assert_eq!(below.max_zones, 64);
        let at = Capabilities::lookup("RP512:ProsysPlus", "1.2.0.7");
        assert_eq!(at.max_zones, 128);
        let above = Capabilities::lookup("RP512:ProsysPlus", "1.3.0.0");
        assert_eq!(above.max_zones, 128);
    }

    #[test]
    fn non_numeric_firmware_falls_back_to_low_zone_count() {
        let caps = Capabilities::lookup("RP512:ProsysPlus", "beta-build");
        assert_eq!(caps.max_zones, 64);
    }

    #[test]
    fn firmware_with_build_suffix_is_split_on_whitespace_before_parsing() {
        let caps = Capabilities::lookup("RP512:ProsysPlus", "1.2.0.7 build-42");
        assert_eq!(caps.max_zones, 128);
    }

    #[test]
    fn group_selector_accepts_letter_or_number() {
        assert_eq!(GroupSelector::Letter('b').resolve().unwrap(), 2);
        assert_eq!(GroupSelector::Number(4).resolve().unwrap(), 4);
        assert!(GroupSelector::Number(5).resolve().is_err());
        assert!(GroupSelector::Letter('Z').resolve().is_err());
    }
}
