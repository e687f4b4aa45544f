//! RDP command processor: the DP registers, the parameter FIFO fed from
//! RDRAM or DMEM, and the optional worker thread. The rasterizer state moves
//! between the bus thread and the worker by value, through spawn and join,
//! so whichever side executes a command owns the state outright.

pub mod raster;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::Console;
use raster::Raster;

/// 64-bit parameter count per opcode; triangles grow with their shade,
/// texture, and depth payloads.
const PARAM_COUNTS: [u8; 0x40] = [
    1, 1, 1, 1, 1, 1, 1, 1, // 0x00-0x07
    4, 6, 12, 14, 12, 14, 20, 22, // 0x08-0x0F
    1, 1, 1, 1, 1, 1, 1, 1, // 0x10-0x17
    1, 1, 1, 1, 1, 1, 1, 1, // 0x18-0x1F
    1, 1, 1, 1, 2, 2, 1, 1, // 0x20-0x27
    1, 1, 1, 1, 1, 1, 1, 1, // 0x28-0x2F
    1, 1, 1, 1, 1, 1, 1, 1, // 0x30-0x37
    1, 1, 1, 1, 1, 1, 1, 1, // 0x38-0x3F
];

const SYNC_FULL: usize = 0x29;

pub struct Rdp {
    pub start_addr: u32,
    pub end_addr: u32,
    pub status: u32,
    addr_base: u32,
    addr_mask: u32,

    /// Words of the command currently being assembled from the bus.
    pending: Vec<u64>,
    /// Complete commands queued for the worker.
    fifo: Arc<Mutex<VecDeque<u64>>>,
    worker: Option<JoinHandle<Raster>>,
    worker_run: Arc<AtomicBool>,
    raster: Option<Raster>,
    threaded: bool,
}

impl Rdp {
    pub fn new(raster: Raster, threaded: bool) -> Self {
        Rdp {
            start_addr: 0,
            end_addr: 0,
            status: 0,
            addr_base: 0xA000_0000,
            addr_mask: 0xFF_FFFF,
            pending: Vec::new(),
            fifo: Arc::new(Mutex::new(VecDeque::new())),
            worker: None,
            worker_run: Arc::new(AtomicBool::new(false)),
            raster: Some(raster),
            threaded,
        }
    }
}

impl Drop for Rdp {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.worker_run.store(false, Ordering::Relaxed);
            let _ = worker.join();
        }
    }
}

/// Drain whole commands from the queue until it runs dry and the driver has
/// asked for a stop. Returns the rasterizer state to the joiner.
fn worker_loop(mut raster: Raster, fifo: Arc<Mutex<VecDeque<u64>>>, run: Arc<AtomicBool>) -> Raster {
    let mut params: Vec<u64> = Vec::with_capacity(22);
    loop {
        {
            let mut queue = fifo.lock().unwrap();
            if let Some(&head) = queue.front() {
                let count = PARAM_COUNTS[((head >> 56) & 0x3F) as usize] as usize;
                if queue.len() >= count {
                    params.extend(queue.drain(..count));
                }
            }
        }

        if params.is_empty() {
            // If requested, stop running once the queue is empty
            if !run.load(Ordering::Relaxed) {
                return raster;
            }
            thread::yield_now();
        } else {
            let op = ((params[0] >> 56) & 0x3F) as u8;
            raster.execute(op, &params);
            params.clear();
        }
    }
}

impl Console {
    /// Read from an RDP register if one exists at the given index.
    pub(crate) fn rdp_read(&self, index: u32) -> u32 {
        match index {
            0 => self.rdp.start_addr,       // DP_START
            1 | 2 => self.rdp.end_addr,     // DP_END, DP_CURRENT
            3 => self.rdp.status,           // DP_STATUS
            _ => {
                log::warn!("Read from unknown RDP register: {}", index);
                0
            }
        }
    }

    /// Write to an RDP register if one exists at the given index.
    pub(crate) fn rdp_write(&mut self, index: u32, value: u32) {
        match index {
            0 => self.rdp.start_addr = value,

            1 => {
                // DP_END: set the command end address and run the commands
                self.rdp.end_addr = value;
                self.rdp_run_commands();
            }

            3 => {
                // Setting the freeze bit is disabled until it actually
                // blocks transfers; some games set it and expect progress
                let value = value & !0x8;

                // Set or clear some status bits
                for i in (0..6).step_by(2) {
                    if value & (1 << i) != 0 {
                        self.rdp.status &= !(1 << (i / 2));
                    } else if value & (1 << (i + 1)) != 0 {
                        self.rdp.status |= 1 << (i / 2);
                    }
                }

                // Update the command address base and mask for the DMEM bit
                if self.rdp.status & 0x1 != 0 {
                    self.rdp.addr_base = 0xA400_0000;
                    self.rdp.addr_mask = 0x0000_0FFF;
                } else {
                    self.rdp.addr_base = 0xA000_0000;
                    self.rdp.addr_mask = 0x00FF_FFFF;
                }

                let bits = value & 0x3C0;
                if bits != 0 {
                    log::warn!("Unimplemented RDP status bits set: 0x{:X}", bits);
                }
            }

            _ => log::warn!("Write to unknown RDP register: {}", index),
        }
    }

    /// Process RDP commands until the end address is reached. Complete
    /// commands are handed to the worker when threading is on; Sync Full
    /// always joins the worker first so the interrupt stays in order.
    pub(crate) fn rdp_run_commands(&mut self) {
        if self.rdp.threaded && self.rdp.worker.is_none() {
            self.rdp_start_worker();
        }

        while self.rdp.start_addr < self.rdp.end_addr {
            // Add a parameter to the buffer
            let word = self.read::<u64>(self.rdp.addr_base + (self.rdp.start_addr & self.rdp.addr_mask));
            self.rdp.pending.push(word);

            // Execute a command once all of its parameters have been received
            let op = ((self.rdp.pending[0] >> 56) & 0x3F) as usize;
            if self.rdp.pending.len() >= PARAM_COUNTS[op] as usize {
                if op == SYNC_FULL {
                    // Everything finishes with the worker drained, so the DP
                    // interrupt can be raised right away
                    self.rdp_finish_worker();
                    self.rdp.pending.clear();
                    self.mi_set_interrupt(5);
                } else if self.rdp.worker.is_some() {
                    let mut queue = self.rdp.fifo.lock().unwrap();
                    queue.extend(self.rdp.pending.drain(..));
                } else {
                    let Rdp { raster, pending, .. } = &mut self.rdp;
                    raster.as_mut().unwrap().execute(op as u8, pending);
                    pending.clear();
                }
            }

            // Move to the next parameter
            self.rdp.start_addr = self.rdp.start_addr.wrapping_add(8);
        }
    }

    fn rdp_start_worker(&mut self) {
        let raster = self.rdp.raster.take().unwrap();
        let fifo = Arc::clone(&self.rdp.fifo);
        let run = Arc::clone(&self.rdp.worker_run);
        run.store(true, Ordering::Relaxed);
        self.rdp.worker = Some(
            thread::Builder::new()
                .name("rdp".into())
                .spawn(move || worker_loop(raster, fifo, run))
                .unwrap(),
        );
    }

    /// Stop the worker, wait for it to drain the queue, and take the
    /// rasterizer state back.
    pub(crate) fn rdp_finish_worker(&mut self) {
        if let Some(worker) = self.rdp.worker.take() {
            self.rdp.worker_run.store(false, Ordering::Relaxed);
            self.rdp.raster = Some(worker.join().unwrap());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_console;
    use super::*;

    /// Write a command list to RDRAM and kick the FIFO registers.
    fn submit(console: &mut Console, base: u32, words: &[u64]) {
        for (i, &word) in words.iter().enumerate() {
            console.write(0xA000_0000 + base + (i as u32) * 8, word);
        }
        console.rdp_write(0, base);
        console.rdp_write(1, base + words.len() as u32 * 8);
    }

    fn fill_setup(width: u64) -> Vec<u64> {
        vec![
            (0x2Fu64 << 56) | (3 << 52),                       // Fill mode
            (0x3Fu64 << 56) | (2 << 51) | ((width - 1) << 32), // Color image at 0
            (0x2Du64 << 56) | (width << 14) | (240 << 2),      // Scissor
            (0x37u64 << 56) | 0x1234_1234,                     // Fill color
        ]
    }

    #[test]
    fn fill_rectangle_through_the_fifo() {
        let mut console = test_console();
        let mut words = fill_setup(320);
        words.push((0x36u64 << 56) | (320 << 46) | (240 << 34)); // Full rect
        words.push(0x29u64 << 56); // Sync Full
        submit(&mut console, 0x10_0000, &words);

        for i in 0..320 * 240 {
            assert_eq!(console.read::<u16>(0xA000_0000 + i * 2), 0x1234);
        }
        // Sync Full raises the DP interrupt
        assert_eq!(console.mi.interrupt & (1 << 5), 1 << 5);
        assert_eq!(console.rdp_read(0), console.rdp_read(1));
    }

    #[test]
    fn commands_split_across_submissions() {
        let mut console = test_console();
        let words = fill_setup(32);
        submit(&mut console, 0x10_0000, &words);

        // A rectangle command split at a register-write boundary: push the
        // first half, then move DP_END past the rest
        let rect = (0x36u64 << 56) | (32 << 46) | (4 << 34);
        console.write(0xA010_0000 + 32, rect);
        console.rdp_write(1, 0x10_0000 + 40);
        assert_eq!(console.read::<u16>(0xA000_0000), 0x1234);
    }

    #[test]
    fn threaded_execution_matches_after_sync_full() {
        let mut console = test_console();
        console.rdp.threaded = true;

        let mut words = fill_setup(64);
        words.push((0x36u64 << 56) | (64 << 46) | (64 << 34));
        words.push(0x29u64 << 56);
        submit(&mut console, 0x10_0000, &words);

        // The Sync Full join guarantees the buffer is complete here
        for i in 0..64 * 64 {
            assert_eq!(console.read::<u16>(0xA000_0000 + i * 2), 0x1234);
        }
        assert!(console.rdp.worker.is_none());
    }

    #[test]
    fn status_write_selects_dmem_source() {
        let mut console = test_console();
        console.rdp_write(3, 1 << 1); // Set the DMEM bit
        assert_eq!(console.rdp.status & 1, 1);
        assert_eq!(console.rdp.addr_base, 0xA400_0000);
        console.rdp_write(3, 1 << 0); // Clear it
        assert_eq!(console.rdp.addr_base, 0xA000_0000);
    }
}
