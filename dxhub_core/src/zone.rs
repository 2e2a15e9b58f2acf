//! Typed accessors over a DataBlock's flex zone.
//!
//! A flex zone is an untyped byte range; [`ZoneRef`]/[`ZoneRefMut`] let
//! callers treat it as a single `T` without copying, while still checking
//! that the zone is large enough and that the channel actually has one.

use crate::error::{HubError, HubResult};
use crate::memory::DataBlock;
use bytemuck::{Pod, Zeroable};
use std::marker::PhantomData;

fn check_fits<T: Pod>(block: &DataBlock) -> HubResult<()> {
    if block.flex_zone_len() < std::mem::size_of::<T>() {
        return Err(HubError::Protocol(format!(
            "flex zone of {} bytes is too small for {} bytes",
            block.flex_zone_len(),
            std::mem::size_of::<T>()
        )));
    }
    Ok(())
}

/// Read-only typed view over a DataBlock's flex zone.
pub struct ZoneRef<'a, T: Pod + Zeroable> {
    block: &'a DataBlock,
    _marker: PhantomData<T>,
}

impl<'a, T: Pod + Zeroable> ZoneRef<'a, T> {
    /// Construct a view over `block`'s flex zone, failing if the zone is
    /// absent or smaller than `size_of::<T>()`.
    pub fn new(block: &'a DataBlock) -> HubResult<Self> {
        check_fits::<T>(block)?;
        Ok(Self { block, _marker: PhantomData })
    }

    /// Copy the flex zone's current bytes out as a `T`.
    pub fn get(&self) -> T {
        let bytes = self.block.flex_zone_read();
        *bytemuck::from_bytes(&bytes[..std::mem::size_of::<T>()])
    }

    pub fn has_zone(&self) -> bool {
        self.block.flex_zone_len() > 0
    }

    pub fn size(&self) -> usize {
        self.block.flex_zone_len()
    }
}

/// Writable typed view over a DataBlock's flex zone. Every write recomputes
/// the zone's stored checksum (see [`DataBlock::flex_zone_write`]).
pub struct ZoneRefMut<'a, T: Pod + Zeroable> {
    block: &'a DataBlock,
    _marker: PhantomData<T>,
}

impl<'a, T: Pod + Zeroable> ZoneRefMut<'a, T> {
    pub fn new(block: &'a DataBlock) -> HubResult<Self> {
        check_fits::<T>(block)?;
        Ok(Self { block, _marker: PhantomData })
    }

    pub fn get(&self) -> T {
        let bytes = self.block.flex_zone_read();
        *bytemuck::from_bytes(&bytes[..std::mem::size_of::<T>()])
    }

    pub fn set(&self, value: T) -> HubResult<()> {
        self.block.flex_zone_write(bytemuck::bytes_of(&value))
    }

    pub fn has_zone(&self) -> bool {
        self.block.flex_zone_len() > 0
    }

    pub fn size(&self) -> usize {
        self.block.flex_zone_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DataBlockConfig;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Pose {
        x: f64,
        y: f64,
    }

    #[test]
    fn zone_ref_mut_round_trips_typed_value() {
        let channel = format!("test.zone.roundtrip.{}", std::process::id());
        let config = DataBlockConfig { capacity: 2, slot_bytes: 8, flex_zone_bytes: 32, ..Default::default() };
        let block = DataBlock::create(&channel, config).expect("create");

        let zone = ZoneRefMut::<Pose>::new(&block).expect("zone fits");
        zone.set(Pose { x: 1.5, y: -2.5 }).expect("set");
        let value = zone.get();
        assert_eq!(value.x, 1.5);
        assert_eq!(value.y, -2.5);
    }

    #[test]
    fn zone_ref_rejects_undersized_flex_zone() {
        let channel = format!("test.zone.undersized.{}", std::process::id());
        let config = DataBlockConfig { capacity: 2, slot_bytes: 8, flex_zone_bytes: 4, ..Default::default() };
        let block = DataBlock::create(&channel, config).expect("create");
        assert!(ZoneRefMut::<Pose>::new(&block).is_err());
    }
}
