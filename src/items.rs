use crate::prelude::*;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sax::{ReadOutcome, RegisterAccess, WriteOutcome};

/// Raw register value written for switch ON, per the SAX firmware contract.
pub const SWITCH_ON: u16 = 2;
/// Raw register value written for switch OFF.
pub const SWITCH_OFF: u16 = 1;

// {{{ Value
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
        }
    }
}
// }}}

// {{{ EntityType
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Sensor,
    SensorCalc,
    Number,
    NumberRo,
    NumberWo,
    Switch,
}

impl EntityType {
    pub fn is_readable(&self) -> bool {
        !matches!(self, EntityType::NumberWo)
    }

    pub fn is_writable(&self) -> bool {
        !matches!(
            self,
            EntityType::Sensor | EntityType::SensorCalc | EntityType::NumberRo
        )
    }
}
// }}}

// {{{ DataType
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U16,
    I16,
    U32,
    I32,
    Bool,
}

impl DataType {
    /// Registers occupied on the wire. 32-bit values span two, high word first.
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::U32 | DataType::I32 => 2,
            _ => 1,
        }
    }
}
// }}}

/// Outcome of reading one item through a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemRead {
    Value(Value),
    Absent,
    ConnectionLost,
}

#[enum_dispatch]
pub trait ItemCommon {
    fn name(&self) -> &str;
    fn entity_type(&self) -> EntityType;
    fn is_readable(&self) -> bool;
    fn is_writable(&self) -> bool;
}

/// Every addressable data point is one of these two; there is no open
/// extension point.
#[enum_dispatch(ItemCommon)]
#[derive(Clone, Debug)]
pub enum Item {
    Register(RegisterItem),
    Calculated(CalculatedItem),
}

// {{{ RegisterItem
#[derive(Clone, Debug)]
pub struct RegisterItem {
    name: String,
    entity_type: EntityType,
    address: u16,
    unit_id: u8,
    data_type: DataType,
    factor: f64,
    offset: f64,
    invalid: Arc<AtomicBool>,
}

impl ItemCommon for RegisterItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    fn is_readable(&self) -> bool {
        self.entity_type.is_readable()
    }

    fn is_writable(&self) -> bool {
        self.entity_type.is_writable()
    }
}

impl RegisterItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        entity_type: EntityType,
        address: u16,
        unit_id: u8,
        data_type: DataType,
        factor: f64,
        offset: f64,
    ) -> Self {
        Self {
            name,
            entity_type,
            address,
            unit_id,
            data_type,
            factor,
            offset,
            invalid: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    pub fn clear_invalid(&self) {
        self.invalid.store(false, Ordering::Relaxed);
    }

    fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::Relaxed);
    }

    /// Reads the item through `transport`. Write-only and invalidated items
    /// never touch the device.
    pub async fn read(&self, transport: &dyn RegisterAccess) -> ItemRead {
        if !self.is_readable() {
            debug!("{}: write-only, skipping read", self.name);
            return ItemRead::Absent;
        }

        if self.is_invalid() {
            debug!("{}: marked invalid, skipping read", self.name);
            return ItemRead::Absent;
        }

        let count = self.data_type.register_count();
        match transport
            .read_registers(self.address, count, self.unit_id)
            .await
        {
            ReadOutcome::Data(registers) => match self.decode(&registers) {
                Some(value) => ItemRead::Value(value),
                None => {
                    warn!(
                        "{}: register {} returned undecodable data {:?}, marking invalid",
                        self.name, self.address, registers
                    );
                    self.mark_invalid();
                    ItemRead::Absent
                }
            },
            ReadOutcome::NoData => ItemRead::Absent,
            ReadOutcome::ConnectionError => ItemRead::ConnectionLost,
        }
    }

    /// Writes `value` through `transport`. Returns false without device I/O
    /// for read-only entity types and unencodable values.
    pub async fn write(&self, transport: &dyn RegisterAccess, value: Value) -> bool {
        if !self.is_writable() {
            warn!(
                "{}: {:?} items are not writable, rejecting write of {}",
                self.name, self.entity_type, value
            );
            return false;
        }

        let Some(registers) = self.encode(value) else {
            warn!("{}: cannot encode {} for {:?}", self.name, value, self.data_type);
            return false;
        };

        match transport
            .write_registers(self.address, registers, self.unit_id)
            .await
        {
            WriteOutcome::Ok => true,
            WriteOutcome::Failed | WriteOutcome::ConnectionError => false,
        }
    }

    /// Raw register words to engineering value: `(raw - offset) * factor`.
    pub fn decode(&self, registers: &[u16]) -> Option<Value> {
        let raw: f64 = match self.data_type {
            DataType::U16 => (*registers.first()?).into(),
            DataType::I16 => (*registers.first()? as i16).into(),
            DataType::U32 => compose_u32(registers)? as f64,
            DataType::I32 => (compose_u32(registers)? as i32) as f64,
            DataType::Bool => {
                return match *registers.first()? {
                    SWITCH_ON => Some(Value::Bool(true)),
                    SWITCH_OFF => Some(Value::Bool(false)),
                    _ => None,
                };
            }
        };

        let engineering = (raw - self.offset) * self.factor;
        if self.factor == 1.0 && self.offset.fract() == 0.0 {
            Some(Value::Int(engineering as i64))
        } else {
            Some(Value::Float(engineering))
        }
    }

    /// Engineering value to raw register words: `value / factor + offset`,
    /// the exact inverse of `decode`.
    pub fn encode(&self, value: Value) -> Option<Vec<u16>> {
        if self.data_type == DataType::Bool {
            return value
                .as_bool()
                .map(|on| vec![if on { SWITCH_ON } else { SWITCH_OFF }]);
        }

        let engineering = value.as_f64()?;
        let raw = (engineering / self.factor + self.offset).round();

        match self.data_type {
            DataType::U16 => (0.0..=f64::from(u16::MAX))
                .contains(&raw)
                .then(|| vec![raw as u16]),
            DataType::I16 => (f64::from(i16::MIN)..=f64::from(i16::MAX))
                .contains(&raw)
                .then(|| vec![raw as i16 as u16]),
            DataType::U32 => (0.0..=f64::from(u32::MAX))
                .contains(&raw)
                .then(|| split_u32(raw as u32)),
            DataType::I32 => (f64::from(i32::MIN)..=f64::from(i32::MAX))
                .contains(&raw)
                .then(|| split_u32(raw as i32 as u32)),
            DataType::Bool => None,
        }
    }
}
// }}}

// {{{ CalculatedItem
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calculation {
    CombinedSoc,
    CombinedPower,
    CumulativeEnergyProduced,
    CumulativeEnergyConsumed,
}

/// A system-level value derived from the battery snapshots rather than a
/// device register. Evaluation lives with the registry in `aggregator`.
#[derive(Clone, Debug)]
pub struct CalculatedItem {
    name: String,
    calculation: Calculation,
}

impl ItemCommon for CalculatedItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn entity_type(&self) -> EntityType {
        EntityType::SensorCalc
    }

    fn is_readable(&self) -> bool {
        true
    }

    fn is_writable(&self) -> bool {
        false
    }
}

impl CalculatedItem {
    pub fn new(name: String, calculation: Calculation) -> Self {
        Self { name, calculation }
    }

    pub fn calculation(&self) -> Calculation {
        self.calculation
    }
}
// }}}

/// Two register words to one 32-bit value, high word first.
pub fn compose_u32(registers: &[u16]) -> Option<u32> {
    match registers {
        [high, low] => Some(((*high as u32) << 16) + *low as u32),
        _ => None,
    }
}

/// Inverse of `compose_u32`.
pub fn split_u32(value: u32) -> Vec<u16> {
    vec![(value >> 16) as u16, (value & 0xFFFF) as u16]
}
