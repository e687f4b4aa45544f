//! Audio interface: a two-slot DMA queue resampled into 48 kHz blocks, a
//! bounded FIFO of pending blocks, and a single output slot the host audio
//! callback drains through an atomic ready flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use super::{Console, Task, CPU_HZ};

pub const SAMPLE_COUNT: usize = 1024;
pub const OUTPUT_RATE: u64 = 48000;
const MAX_BUFFERS: usize = 4;

/// The host-facing output slot: one block of stereo samples plus the flag
/// that hands it between the emulator and the audio callback.
pub struct AudioOutput {
    buffer: Mutex<[u32; SAMPLE_COUNT]>,
    ready: AtomicBool,
}

impl Default for AudioOutput {
    fn default() -> Self {
        AudioOutput { buffer: Mutex::new([0; SAMPLE_COUNT]), ready: AtomicBool::new(false) }
    }
}

impl AudioOutput {
    /// Block until a buffer is ready and copy it out, but never stall the
    /// audio callback longer than a frame; on timeout the last played sample
    /// is repeated to paper over the underrun.
    pub fn fill_buffer(&self, out: &mut [u32; SAMPLE_COUNT]) {
        let start = Instant::now();
        while !self.ready.load(Ordering::Acquire) {
            if start.elapsed() > Duration::from_micros(1_000_000 / 60) {
                let last = self.buffer.lock().unwrap()[SAMPLE_COUNT - 1];
                out.fill(last);
                return;
            }
            thread::yield_now();
        }

        out.copy_from_slice(&*self.buffer.lock().unwrap());
        self.ready.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Default)]
struct Samples {
    address: u32,
    count: u32,
}

pub struct Ai {
    samples: [Samples; 2],
    buffers: VecDeque<Vec<u32>>,
    offset: usize,

    dram_addr: u32,
    control: u32,
    frequency: u32,
    status: u32,
}

impl Ai {
    pub fn new() -> Self {
        Ai {
            samples: [Samples::default(); 2],
            buffers: VecDeque::new(),
            offset: 0,
            dram_addr: 0,
            control: 0,
            frequency: 0,
            status: 0,
        }
    }

    pub fn read(&self, address: u32) -> u32 {
        match address {
            0x450_000C => self.status, // AI_STATUS
            _ => {
                log::warn!("Unknown AI register read: 0x{:X}", address);
                0
            }
        }
    }
}

impl Console {
    pub(crate) fn ai_reset(&mut self) {
        self.ai = Ai::new();

        // Schedule the first audio buffer to output
        self.schedule(Task::CreateBuffer, (SAMPLE_COUNT as u64 * CPU_HZ / OUTPUT_RATE) as u32);
    }

    pub(crate) fn ai_write(&mut self, address: u32, value: u32) {
        match address {
            0x450_0000 => self.ai.dram_addr = value & 0xFF_FFFF, // AI_DRAM_ADDR

            0x450_0004 => {
                // AI_LENGTH: queue samples when DMA is enabled
                if self.ai.control != 0 {
                    if self.ai.status & (1 << 30) != 0 {
                        // Queue a second set while the first is processed
                        self.ai.status |= 1 << 31; // Full
                        self.ai.samples[1] =
                            Samples { address: self.ai.dram_addr, count: (value & !0x7) / 4 };
                    } else {
                        // Queue a set of samples and submit them right away
                        self.ai.status |= 1 << 30; // Busy
                        self.ai.samples[0] =
                            Samples { address: self.ai.dram_addr, count: (value & !0x7) / 4 };
                        self.ai_submit_buffer();
                    }
                }
            }

            0x450_0008 => self.ai.control = value & 0x1, // AI_CONTROL

            0x450_000C => self.mi_clear_interrupt(2), // AI_STATUS acknowledges

            0x450_0010 => {
                // AI_DAC_RATE: derive the frequency from the NTSC DAC rate
                self.ai.frequency = 48_681_812 / (value & 0x3FFF).max(1);
            }

            _ => log::warn!("Unknown AI register write: 0x{:X}", address),
        }
    }

    /// Fill the output slot from the FIFO and mark it ready. Runs at a fixed
    /// host-rate period; if the previous block hasn't been consumed yet the
    /// emulator waits, which is what paces emulation to the audio device.
    pub(crate) fn ai_create_buffer(&mut self) {
        while self.running.load(Ordering::Relaxed) && self.audio.ready.load(Ordering::Acquire) {
            thread::yield_now();
        }

        {
            let mut out = self.audio.buffer.lock().unwrap();
            out.fill(0);
            let mut count = 0;

            while count < SAMPLE_COUNT {
                let offset = self.ai.offset;
                let Some(buffer) = self.ai.buffers.front() else { break };
                let available = buffer.len() - offset;
                let space = SAMPLE_COUNT - count;

                if available <= space {
                    // Copy all of the remaining queued samples
                    out[count..count + available].copy_from_slice(&buffer[offset..]);
                    count += available;
                    self.ai.offset = 0;
                    self.ai.buffers.pop_front();
                } else {
                    // Copy as many queued samples as fit
                    out[count..count + space].copy_from_slice(&buffer[offset..offset + space]);
                    self.ai.offset += space;
                    break;
                }
            }
        }

        // Mark the buffer as ready and schedule the next one
        self.audio.ready.store(true, Ordering::Release);
        self.schedule(Task::CreateBuffer, (SAMPLE_COUNT as u64 * CPU_HZ / OUTPUT_RATE) as u32);
    }

    /// Resample the queued guest samples to the host rate and push them onto
    /// the FIFO, then schedule the logical DMA completion.
    pub(crate) fn ai_submit_buffer(&mut self) {
        let samples = self.ai.samples[0];
        let frequency = self.ai.frequency.max(1) as u64;
        log::info!(
            "Submitting {} AI samples from RDRAM 0x{:X} at frequency {}Hz",
            samples.count,
            samples.address,
            self.ai.frequency
        );

        if self.ai.buffers.len() < MAX_BUFFERS {
            // Scale the sample count from the original frequency
            let count = (samples.count as u64 * OUTPUT_RATE / frequency) as usize;
            let mut buffer = vec![0u32; count];

            for (i, slot) in buffer.iter_mut().enumerate() {
                let address =
                    samples.address + (i as u64 * samples.count as u64 / count.max(1) as u64) as u32 * 4;
                let value = self.read::<u32>(0xA000_0000 + address);
                *slot = value.rotate_left(16); // Swap the left/right halves
            }

            self.ai.buffers.push_back(buffer);
        }

        self.schedule(Task::ProcessBuffer, (samples.count as u64 * CPU_HZ / frequency) as u32);
    }

    /// Advance the DMA slot queue when a buffer's playback time elapses.
    pub(crate) fn ai_process_buffer(&mut self) {
        if self.ai.status & (1 << 31) != 0 {
            // Submit the queued samples and interrupt to request more
            self.ai.status &= !(1 << 31); // Not full
            self.ai.samples[0] = self.ai.samples[1];
            self.ai_submit_buffer();
            self.mi_set_interrupt(2);
        } else {
            // Stop running because there are no more samples to submit
            self.ai.status &= !(1 << 30); // Not busy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_console;
    use super::*;

    #[test]
    fn dac_rate_sets_the_frequency() {
        let mut console = test_console();
        console.ai_write(0x450_0010, 48_681_812 / 24000);
        assert_eq!(console.ai.frequency, 24004); // Integer division both ways
    }

    #[test]
    fn length_write_resamples_to_the_host_rate() {
        let mut console = test_console();
        // 1024 samples of 0x0001_0002 at half the output rate
        for i in 0..1024 {
            console.write::<u32>(0xA000_2000 + i * 4, 0x0001_0002);
        }
        console.ai.frequency = 24000;
        console.ai_write(0x450_0008, 1); // Enable DMA
        console.ai_write(0x450_0000, 0x2000);
        console.ai_write(0x450_0004, 1024 * 4);

        assert_eq!(console.ai.buffers.len(), 1);
        let buffer = &console.ai.buffers[0];
        assert_eq!(buffer.len(), 2048);
        // The 16-bit halves are swapped relative to RDRAM
        assert!(buffer.iter().all(|&sample| sample == 0x0002_0001));
        assert_ne!(console.ai.status & (1 << 30), 0); // Busy
    }

    #[test]
    fn second_length_write_queues_while_busy() {
        let mut console = test_console();
        console.ai.frequency = 48000;
        console.ai_write(0x450_0008, 1);
        console.ai_write(0x450_0000, 0x1000);
        console.ai_write(0x450_0004, 512 * 4);
        console.ai_write(0x450_0000, 0x3000);
        console.ai_write(0x450_0004, 512 * 4);

        assert_ne!(console.ai.status & (1 << 31), 0); // Full
        assert_eq!(console.ai.buffers.len(), 1);

        // Completion submits the second buffer and raises the AI interrupt
        console.ai_process_buffer();
        assert_eq!(console.ai.status & (1 << 31), 0);
        assert_eq!(console.ai.buffers.len(), 2);
        assert_ne!(console.mi.interrupt & (1 << 2), 0);

        // A second completion with nothing queued clears busy
        console.ai_process_buffer();
        assert_eq!(console.ai.status & (1 << 30), 0);
    }

    #[test]
    fn create_buffer_drains_the_fifo_into_the_output_slot() {
        let mut console = test_console();
        console.ai.buffers.push_back(vec![0xAAAA_AAAA; 600]);
        console.ai.buffers.push_back(vec![0xBBBB_BBBB; 600]);
        console.ai_create_buffer();

        assert!(console.audio.ready.load(Ordering::Acquire));
        let out = console.audio.buffer.lock().unwrap();
        assert_eq!(out[0], 0xAAAA_AAAA);
        assert_eq!(out[599], 0xAAAA_AAAA);
        assert_eq!(out[600], 0xBBBB_BBBB);
        assert_eq!(out[1023], 0xBBBB_BBBB);
        drop(out);

        // The second block's remainder stays queued at the right offset
        assert_eq!(console.ai.buffers.len(), 1);
        assert_eq!(console.ai.offset, 424);
    }
}
