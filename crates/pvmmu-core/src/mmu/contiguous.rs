//! Machine-contiguous regions.
//!
//! Some devices need buffers that are contiguous in machine memory and
//! addressable with a limited number of bits. Such a region is built by
//! handing the scattered machine frames behind a range of the direct map
//! back to the hypervisor in exchange for one contiguous extent, and torn
//! down by the reverse trade.

use super::{Entry, Mmu};
use crate::{
    Architecture as _, DomId, LazyMode, MemoryExchange, Mfn, MmuDriver, MmuError, MulticallEntry,
    TableEntry as _, UvmFlags, Va, VcpuId,
};

impl<Driver> Mmu<Driver>
where
    Driver: MmuDriver,
{
    /// Makes the `2^order` pages at `vstart` machine-contiguous, with every
    /// machine address fitting in `address_bits` bits.
    ///
    /// The contents of the region are lost. If the hypervisor cannot supply
    /// a suitable extent, the original frames are mapped back and
    /// [`MmuError::OutOfMemory`] is returned.
    ///
    /// # Panics
    ///
    /// Panics if the hypervisor reports a partial exchange.
    pub fn make_contiguous(
        &self,
        vcpu: VcpuId,
        vstart: Va,
        order: u32,
        address_bits: u32,
    ) -> Result<(), MmuError> {
        if self.info.auto_translated {
            return Ok(());
        }

        self.vcpu(vcpu)?;
        self.check_order(order)?;
        self.clear_region(vstart, order)?;

        let count = 1usize << order;
        let mut reservation = self.reservation.lock();
        let in_frames = &mut reservation[..count];

        self.zap_region(vcpu, vstart, order, Some(&mut *in_frames), None)?;

        let mut out_frames = [Driver::Architecture::va_to_pfn(vstart).0];
        let success = self.exchange(in_frames, 0, &mut out_frames, order, address_bits);

        if success {
            self.remap_region(vcpu, vstart, order, None, Mfn(out_frames[0]))?;
            tracing::debug!(%vstart, order, address_bits, first = out_frames[0], "region made contiguous");
            return Ok(());
        }

        self.remap_region(vcpu, vstart, order, Some(&*in_frames), Mfn(0))?;
        tracing::warn!(%vstart, order, address_bits, "no contiguous extent available");
        Err(MmuError::OutOfMemory)
    }

    /// Trades the machine-contiguous region at `vstart` back for ordinary
    /// frames.
    ///
    /// If the hypervisor refuses, the contiguous extent stays mapped and
    /// [`MmuError::ExchangeFailed`] is returned.
    ///
    /// # Panics
    ///
    /// Panics if the hypervisor reports a partial exchange.
    pub fn destroy_contiguous(&self, vcpu: VcpuId, vstart: Va, order: u32) -> Result<(), MmuError> {
        if self.info.auto_translated {
            return Ok(());
        }

        self.vcpu(vcpu)?;
        self.check_order(order)?;
        self.clear_region(vstart, order)?;

        let count = 1usize << order;
        let mut reservation = self.reservation.lock();
        let out_frames = &mut reservation[..count];

        let in_frame = self.va_to_mfn(vstart);
        self.zap_region(vcpu, vstart, order, None, Some(&mut *out_frames))?;

        let success = self.exchange(&[in_frame.0], order, out_frames, 0, 0);

        if success {
            self.remap_region(vcpu, vstart, order, Some(&*out_frames), Mfn(0))?;
            tracing::debug!(%vstart, order, "contiguous region released");
            return Ok(());
        }

        self.remap_region(vcpu, vstart, order, None, in_frame)?;
        tracing::warn!(%vstart, order, "contiguous region could not be released");
        Err(MmuError::ExchangeFailed)
    }

    fn check_order(&self, order: u32) -> Result<(), MmuError> {
        let max = self.config.max_contig_order;
        if order > max {
            return Err(MmuError::OrderTooLarge { order, max });
        }

        Ok(())
    }

    fn clear_region(&self, vstart: Va, order: u32) -> Result<(), MmuError> {
        for index in 0..1u64 << order {
            self.driver
                .clear_page(vstart + (index << Driver::Architecture::PAGE_SHIFT))?;
        }

        Ok(())
    }

    /// Unmaps the region and forgets its frames.
    ///
    /// The machine frames are recorded in `in_frames` and the physical
    /// frames in `out_frames`, if given.
    fn zap_region(
        &self,
        vcpu: VcpuId,
        vstart: Va,
        order: u32,
        mut in_frames: Option<&mut [u64]>,
        mut out_frames: Option<&mut [u64]>,
    ) -> Result<(), MmuError> {
        let mut batch = self.batch(vcpu)?;

        for index in 0..1usize << order {
            let va = vstart + ((index as u64) << Driver::Architecture::PAGE_SHIFT);
            let pfn = Driver::Architecture::va_to_pfn(va);

            if let Some(frames) = in_frames.as_deref_mut() {
                frames[index] = self.pfn_to_mfn(pfn).0;
            }

            batch.entry(MulticallEntry::UpdateVaMapping {
                va,
                val: 0,
                flags: UvmFlags::empty(),
            });

            self.set_phys_to_machine(pfn, Mfn::INVALID);

            if let Some(frames) = out_frames.as_deref_mut() {
                frames[index] = pfn.0;
            }
        }

        batch.issue(LazyMode::None);
        Ok(())
    }

    /// Maps the region back onto `mfns`, or onto the extent starting at
    /// `first` if `mfns` is `None`, and records the new frames.
    fn remap_region(
        &self,
        vcpu: VcpuId,
        vstart: Va,
        order: u32,
        mfns: Option<&[u64]>,
        first: Mfn,
    ) -> Result<(), MmuError> {
        let limit = 1usize << order;
        let mut batch = self.batch(vcpu)?;

        for index in 0..limit {
            let flags = match (index + 1 == limit, order) {
                (false, _) => UvmFlags::empty(),
                (true, 0) => UvmFlags::INVLPG | UvmFlags::ALL,
                (true, _) => UvmFlags::TLB_FLUSH | UvmFlags::ALL,
            };

            let mfn = match mfns {
                Some(mfns) => Mfn(mfns[index]),
                None => first + index as u64,
            };

            let va = vstart + ((index as u64) << Driver::Architecture::PAGE_SHIFT);
            let entry = Entry::<Driver>::from_parts(mfn.0, Driver::Architecture::PAGE_KERNEL);

            batch.entry(MulticallEntry::UpdateVaMapping {
                va,
                val: entry.raw(),
                flags,
            });

            self.set_phys_to_machine(Driver::Architecture::va_to_pfn(va), mfn);
        }

        batch.issue(LazyMode::None);
        Ok(())
    }

    /// Trades `input` for `output.len()` extents of `output_order`.
    ///
    /// Returns `true` if every input extent was exchanged.
    fn exchange(
        &self,
        input: &[u64],
        input_order: u32,
        output: &mut [u64],
        output_order: u32,
        address_bits: u32,
    ) -> bool {
        let extents_in = input.len() as u64;

        let mut exchange = MemoryExchange {
            input,
            input_order,
            output,
            output_order,
            address_bits,
            domid: DomId::SELF,
            nr_exchanged: 0,
        };

        let result = self.driver.memory_exchange(&mut exchange);
        let nr_exchanged = exchange.nr_exchanged;
        let success = nr_exchanged == extents_in;

        // The hypervisor either trades everything or nothing.
        if (!success && (nr_exchanged != 0 || result.is_ok())) || (success && result.is_err()) {
            tracing::error!(nr_exchanged, extents_in, ?result, "inconsistent memory exchange");
            panic!("inconsistent memory exchange: {nr_exchanged} of {extents_in} extents");
        }

        if let Err(err) = result {
            tracing::debug!(%err, "memory exchange refused");
        }

        success
    }
}
