//! CP0: system control. Exception dispatch, the count/compare timer (kept
//! lazy and reconstructed from the global cycle counter), interrupt checks
//! fed by the MI, and the TLB maintenance instructions.

use super::super::{Console, Task};
use crate::n64::memory::TlbEntry;

pub struct Cp0 {
    pub index: u32,
    pub entry_lo0: u32,
    pub entry_lo1: u32,
    pub context: u32,
    pub page_mask: u32,
    pub bad_vaddr: u32,
    pub count: u32,
    pub entry_hi: u32,
    pub compare: u32,
    pub status: u32,
    pub cause: u32,
    pub epc: u32,
    pub error_epc: u32,

    pub irq_pending: bool,
    pub start_cycles: u32,
    pub end_cycles: u32,
}

impl Cp0 {
    pub fn new() -> Self {
        Cp0 {
            index: 0,
            entry_lo0: 0,
            entry_lo1: 0,
            context: 0,
            page_mask: 0,
            bad_vaddr: 0,
            count: 0,
            entry_hi: 0,
            compare: 0,
            status: 0,
            cause: 0,
            epc: 0,
            error_epc: 0,
            irq_pending: false,
            start_cycles: 0,
            end_cycles: u32::MAX,
        }
    }
}

impl Console {
    pub(crate) fn cp0_reset(&mut self) {
        self.cp0 = Cp0::new();
        self.cp0.status = 0x40_0004;
        self.cp0_schedule_count();
    }

    /// Read from a CPU CP0 register if one exists at the given index.
    pub(crate) fn cp0_read(&self, index: u32) -> u32 {
        match index {
            0 => self.cp0.index,
            2 => self.cp0.entry_lo0,
            3 => self.cp0.entry_lo1,
            4 => self.cp0.context,
            5 => self.cp0.page_mask,
            8 => self.cp0.bad_vaddr,

            // Count, as it would be at the current cycle
            9 => self
                .cp0
                .count
                .wrapping_add(self.global_cycles.wrapping_sub(self.cp0.start_cycles) >> 2),

            10 => self.cp0.entry_hi,
            11 => self.cp0.compare,
            12 => self.cp0.status,
            13 => self.cp0.cause,
            14 => self.cp0.epc,
            30 => self.cp0.error_epc,

            _ => {
                log::warn!("Read from unknown CPU CP0 register: {}", index);
                0
            }
        }
    }

    /// Write to a CPU CP0 register if one exists at the given index.
    pub(crate) fn cp0_write(&mut self, index: u32, value: u32) {
        match index {
            0 => self.cp0.index = value & 0x3F,
            2 => self.cp0.entry_lo0 = value & 0x3FF_FFFF,
            3 => self.cp0.entry_lo1 = value & 0x3FF_FFFF,
            4 => self.cp0.context = value & 0xFFFF_FFF0,
            5 => self.cp0.page_mask = value & 0x1FF_E000,

            9 => {
                // Set the count register and reschedule its next update
                self.cp0.count = value;
                self.cp0_schedule_count();
            }

            10 => self.cp0.entry_hi = value & 0xFFFF_E0FF,

            11 => {
                // Set the compare register and acknowledge a timer interrupt
                self.cp0.compare = value;
                self.cp0.cause &= !0x8000;

                // Update the count register and reschedule its next update
                self.cp0.count = self
                    .cp0
                    .count
                    .wrapping_add(self.global_cycles.wrapping_sub(self.cp0.start_cycles) >> 2);
                self.cp0_schedule_count();
            }

            12 => {
                // Set the status register and apply the FR bit to the CP1
                self.cp0.status = value & 0xFF57_FFFF;
                self.cp0_check_interrupts();
                self.cp1.set_reg_mode(self.cp0.status & (1 << 26) != 0);

                // Keep track of unimplemented bits that should do something
                let bits = value & 0xB00_00E0;
                if bits != 0 {
                    log::warn!("Unimplemented CPU CP0 status bits set: 0x{:X}", bits);
                }
            }

            13 => {
                // Set the software interrupt flags
                self.cp0.cause = (self.cp0.cause & !0x300) | (value & 0x300);
                self.cp0_check_interrupts();
            }

            14 => self.cp0.epc = value,
            30 => self.cp0.error_epc = value,

            _ => log::warn!("Write to unknown CPU CP0 register: {}", index),
        }
    }

    /// Adjust the cycle counts for a cycle reset.
    pub(crate) fn cp0_reset_cycles(&mut self) {
        self.cp0.start_cycles = self.cp0.start_cycles.wrapping_sub(self.global_cycles);
        self.cp0.end_cycles = self.cp0.end_cycles.wrapping_sub(self.global_cycles);
    }

    /// Assuming count was just updated, schedule its next update. This is done
    /// as close to the compare match as possible, limited to prevent overflow.
    fn cp0_schedule_count(&mut self) {
        self.cp0.start_cycles = self.global_cycles;
        let delta = u32::min(self.cp0.compare.wrapping_sub(self.cp0.count) << 2, 0x4000_0000);
        let mut cycles = self.cp0.start_cycles.wrapping_add(delta);
        if cycles == self.cp0.start_cycles {
            cycles = cycles.wrapping_add(4);
        }

        // Only reschedule if the update is sooner than what's already
        // scheduled, so heavy register use doesn't flood the scheduler
        if self.cp0.end_cycles > cycles {
            self.schedule(Task::UpdateCount, cycles - self.cp0.start_cycles);
            self.cp0.end_cycles = cycles;
        }
    }

    pub(crate) fn cp0_update_count(&mut self) {
        // Ignore the update if it was rescheduled
        if self.global_cycles != self.cp0.end_cycles {
            return;
        }

        // Update count and request a timer interrupt if it matches compare
        self.cp0.count = self
            .cp0
            .count
            .wrapping_add(self.cp0.end_cycles.wrapping_sub(self.cp0.start_cycles) >> 2);
        if self.cp0.count == self.cp0.compare {
            self.cp0.cause |= 0x8000;
            self.cp0_check_interrupts();
        }

        // Schedule the next update unconditionally
        self.cp0.end_cycles = u32::MAX;
        self.cp0_schedule_count();
    }

    pub(crate) fn cp0_check_interrupts(&mut self) {
        // Set the external interrupt bit if any MI interrupt is set
        let pending = (self.mi.interrupt & self.mi.mask != 0) as u32;
        self.cp0.cause = (self.cp0.cause & !0x400) | (pending << 10);

        // Schedule an interrupt if able and an enabled bit is set
        if (self.cp0.status & 0x3) == 0x1
            && (self.cp0.status & self.cp0.cause & 0xFF00) != 0
            && !self.cp0.irq_pending
        {
            self.schedule(Task::RaiseInterrupt, 2); // 1 CPU cycle
            self.cp0.irq_pending = true;
        }
    }

    /// Trigger an interrupt that has been scheduled.
    pub(crate) fn cp0_interrupt(&mut self) {
        self.cp0_exception(0);
        self.cp0.irq_pending = false;
    }

    /// Update registers for an exception and jump to the handler.
    pub(crate) fn cp0_exception(&mut self, kind: u8) {
        self.cp0.status |= 0x2; // EXL
        self.cp0.cause = (self.cp0.cause & !0x8000_007C) | (((kind as u32) << 2) & 0x7C);
        self.cp0.epc = self.cpu.pc.wrapping_sub(if kind != 0 { 4 } else { 0 });
        let base: u32 = if self.cp0.status & (1 << 22) != 0 { 0xBFC0_0200 } else { 0x8000_0000 };
        self.cpu.pc = base.wrapping_sub(4);
        self.cpu.next_opcode = 0;

        // Adjust the exception vector based on the type
        if (kind & !1) != 2 {
            // Not a TLB miss
            self.cpu.pc = self.cpu.pc.wrapping_add(0x180);
        }

        // Return to the preceding branch if the exception occurred in a delay slot
        if let Some(branch) = self.cpu.delay_slot {
            self.cp0.epc = branch;
            self.cp0.cause |= 1 << 31; // BD
        }

        // Unhalt the CPU if it was idling
        self.cpu_running = true;
    }

    /// Set the address that caused a TLB exception.
    pub(crate) fn cp0_set_tlb_address(&mut self, address: u32) {
        self.cp0.bad_vaddr = address;
        self.cp0.entry_hi = address & 0xFFFF_E000;
        self.cp0.context = (self.cp0.context & !0x7F_FFF0) | ((address >> 9) & 0x7F_FFF0);
    }

    /// Check if a coprocessor is usable (CP0 is always usable in kernel mode).
    pub(crate) fn cp0_usable(&mut self, cp: u32) -> bool {
        if self.cp0.status & (1 << (28 + cp)) == 0
            && (cp > 0 || (self.cp0.status & 0x6 == 0 && self.cp0.status & 0x18 != 0))
        {
            // Set the coprocessor number bits
            self.cp0.cause = (self.cp0.cause & !(0x3 << 28)) | ((cp & 0x3) << 28);
            return false;
        }
        true
    }

    /// Execute a CP0 operation, using opcode bits 0-5.
    pub(crate) fn cp0_op(&mut self, opcode: u32) {
        match opcode & 0x3F {
            0x01 => {
                // TLBR: get the TLB entry at the current index
                let entry = self.memory.entry(self.cp0.index);
                self.cp0.entry_lo0 = entry.entry_lo0;
                self.cp0.entry_lo1 = entry.entry_lo1;
                self.cp0.entry_hi = entry.entry_hi;
                self.cp0.page_mask = entry.page_mask;
            }

            0x02 => {
                // TLBWI: set the TLB entry at the current index
                self.memory.set_entry(
                    self.cp0.index,
                    TlbEntry {
                        entry_lo0: self.cp0.entry_lo0,
                        entry_lo1: self.cp0.entry_lo1,
                        entry_hi: self.cp0.entry_hi,
                        page_mask: self.cp0.page_mask,
                    },
                );
            }

            0x08 => {
                // TLBP: search the TLB for an entry matching the high register
                for i in 0..32 {
                    if self.memory.entry(i).entry_hi == self.cp0.entry_hi {
                        self.cp0.index = i;
                        return;
                    }
                }

                // Set the index high bit if no match was found
                self.cp0.index = 1 << 31;
            }

            0x18 => {
                // ERET: return from an exception and clear the ERL or EXL bit
                let error = self.cp0.status & 0x4 != 0;
                let target = if error { self.cp0.error_epc } else { self.cp0.epc };
                self.cpu.pc = target.wrapping_sub(4);
                self.cpu.next_opcode = 0;
                self.cp0.status &= !if error { 0x4 } else { 0x2 };
            }

            _ => log::error!(
                "Unknown CP0 opcode: 0x{:08X} @ 0x{:X}",
                opcode,
                self.cpu.pc.wrapping_sub(4)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::super::test_console;

    #[test]
    fn count_advances_at_a_quarter_of_the_cycle_rate() {
        let mut console = test_console();
        console.cp0_write(9, 0);
        console.global_cycles = console.global_cycles.wrapping_add(400);
        let base = console.cp0_read(9);
        assert_eq!(base, 100);
    }

    #[test]
    fn compare_write_acknowledges_timer_interrupt() {
        let mut console = test_console();
        console.cp0.cause |= 0x8000;
        console.cp0_write(11, 0x1234);
        assert_eq!(console.cp0.cause & 0x8000, 0);
        assert_eq!(console.cp0_read(11), 0x1234);
    }

    #[test]
    fn exception_sets_exl_cause_and_vector() {
        let mut console = test_console();
        console.cpu.pc = 0x8000_1004; // Mid-execution: points at the delay slot
        console.cp0_exception(12);
        assert_ne!(console.cp0.status & 0x2, 0);
        assert_eq!((console.cp0.cause >> 2) & 0x1F, 12);
        assert_eq!(console.cp0.epc, 0x8000_1000);
        // The pipelined fetch lands on the general vector
        assert_eq!(console.cpu.pc.wrapping_add(4), 0x8000_0180);
        assert_eq!(console.cpu.next_opcode, 0);
    }

    #[test]
    fn tlb_miss_uses_the_refill_vector() {
        let mut console = test_console();
        console.cpu.pc = 0x8000_1004;
        console.cp0_exception(2);
        assert_eq!(console.cpu.pc.wrapping_add(4), 0x8000_0000);
    }

    #[test]
    fn exception_in_delay_slot_rewinds_to_the_branch() {
        let mut console = test_console();
        console.cpu.pc = 0x8000_1008;
        console.cpu.delay_slot = Some(0x8000_1000);
        console.cp0_exception(12);
        assert_eq!(console.cp0.epc, 0x8000_1000);
        assert_ne!(console.cp0.cause & (1 << 31), 0);
    }

    #[test]
    fn tlb_index_ops_round_trip_through_the_tlb() {
        let mut console = test_console();
        console.cp0_write(0, 5); // Index
        console.cp0_write(2, 0x0123_4 | 0x4); // EntryLo0
        console.cp0_write(3, 0x0567_8 | 0x4); // EntryLo1
        console.cp0_write(10, 0x0040_0000); // EntryHi
        console.cp0_write(5, 0x0000_6000); // PageMask
        console.cp0_op(0x02); // TLBWI

        console.cp0_write(2, 0);
        console.cp0_write(3, 0);
        console.cp0_op(0x01); // TLBR
        assert_eq!(console.cp0_read(2), 0x0123_4 | 0x4);
        assert_eq!(console.cp0_read(3), 0x0567_8 | 0x4);
        assert_eq!(console.cp0_read(5), 0x0000_6000);

        // TLBP finds the entry by EntryHi
        console.cp0_write(0, 0);
        console.cp0_op(0x08);
        assert_eq!(console.cp0_read(0), 5);

        console.cp0_write(10, 0x0080_0000);
        console.cp0_op(0x08);
        assert_eq!(console.cp0_read(0), 1 << 31);
    }
}
