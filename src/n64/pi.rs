//! Peripheral interface: instantaneous cart→RDRAM DMA with an interrupt on
//! completion. Bytes past the end of the ROM read as 0xFF.

use super::Console;

pub struct Pi {
    dram_addr: u32,
    cart_addr: u32,
}

impl Pi {
    pub fn new() -> Self {
        Pi { dram_addr: 0, cart_addr: 0 }
    }

    pub fn read(&self, address: u32) -> u32 {
        log::warn!("Unknown PI register read: 0x{:X}", address);
        0
    }
}

impl Console {
    pub(crate) fn pi_write(&mut self, address: u32, value: u32) {
        match address {
            0x460_0000 => self.pi.dram_addr = value & 0xFF_FFFF, // PI_DRAM_ADDR
            0x460_0004 => self.pi.cart_addr = value,             // PI_CART_ADDR

            0x460_000C => self.pi_perform_dma(value), // PI_WR_LEN

            0x460_0010 => {
                // PI_STATUS: acknowledge a PI interrupt when bit 1 is set
                if value & 0x2 != 0 {
                    self.mi_clear_interrupt(4);
                }
            }

            _ => log::warn!("Unknown PI register write: 0x{:X}", address),
        }
    }

    fn pi_perform_dma(&mut self, length: u32) {
        let size = (length & 0xFF_FFFF) + 1;
        log::info!(
            "PI DMA from 0x{:X} to 0x{:X} with size 0x{:X}",
            self.pi.cart_addr,
            self.pi.dram_addr,
            size
        );

        // Copy data from the cartridge to memory
        let limit = u32::min(0xFC0_0000, self.rom.len() as u32);
        for i in 0..size {
            let dst = 0x8000_0000 + self.pi.dram_addr + i;
            let src = self.pi.cart_addr.wrapping_sub(0x1000_0000).wrapping_add(i);
            let value = if src < limit { self.rom[src as usize] } else { 0xFF };
            self.write::<u8>(dst, value);
        }

        // Request a PI interrupt when the DMA finishes
        self.mi_set_interrupt(4);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_console;

    #[test]
    fn dma_copies_rom_and_pads_past_the_end() {
        let mut console = test_console();
        for i in 0..8 {
            console.rom[i] = i as u8 + 1;
        }
        let rom_len = console.rom.len() as u32;

        console.pi_write(0x460_0000, 0x1000);
        console.pi_write(0x460_0004, 0x1000_0000);
        console.pi_write(0x460_000C, 7); // 8 bytes
        for i in 0..8 {
            assert_eq!(console.read::<u8>(0x8000_1000 + i), i as u8 + 1);
        }
        assert_ne!(console.mi.interrupt & (1 << 4), 0);

        // Reads past the ROM end come back as 0xFF
        console.pi_write(0x460_0000, 0x2000);
        console.pi_write(0x460_0004, 0x1000_0000 + rom_len);
        console.pi_write(0x460_000C, 3);
        for i in 0..4 {
            assert_eq!(console.read::<u8>(0x8000_2000 + i), 0xFF);
        }
    }
}
