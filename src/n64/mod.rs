//! The console: every component wired together under one owner, plus the
//! cycle-sorted task scheduler and the dual-processor stepping loop that
//! interleaves the CPU and RSP at a fixed 2:3 cycle ratio.

pub mod ai;
pub mod cpu;
pub mod memory;
pub mod mi;
pub mod pi;
pub mod pif;
pub mod rdp;
pub mod rsp;
pub mod si;
pub mod vi;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::Receiver;

use crate::config::Config;
use crate::core::SaveFile;
use ai::{Ai, AudioOutput};
use cpu::cp0::Cp0;
use cpu::cp1::Cp1;
use cpu::Cpu;
use memory::Memory;
use mi::Mi;
use pi::Pi;
use pif::{InputEvent, Pif};
use rdp::raster::Raster;
use rdp::Rdp;
use rsp::cp0::RspCp0;
use rsp::cp2::RspCp2;
use rsp::Rsp;
use si::Si;
use vi::{FrameQueue, Vi};

/// Scheduler cycles per second: 93.75 MHz * 2.
pub const CPU_HZ: u64 = 93_750_000 * 2;

/// Everything the scheduler can be asked to run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Task {
    ResetCycles,
    UpdateCount,
    RaiseInterrupt,
    DrawFrame,
    CreateBuffer,
    ProcessBuffer,
}

#[derive(Clone, Copy)]
pub(crate) struct Event {
    pub cycles: u32,
    pub task: Task,
}

pub struct Console {
    // Scheduler state
    pub(crate) tasks: Vec<Event>,
    pub global_cycles: u32,
    cpu_cycles: u32,
    rsp_cycles: u32,
    pub cpu_running: bool,
    pub rsp_running: bool,

    // Components
    pub(crate) rom: Vec<u8>,
    pub(crate) memory: Memory,
    pub(crate) mi: Mi,
    pub(crate) pif: Pif,
    pub(crate) ai: Ai,
    pub(crate) vi: Vi,
    pub(crate) pi: Pi,
    pub(crate) si: Si,
    pub(crate) cpu: Cpu,
    pub(crate) cp0: Cp0,
    pub(crate) cp1: Cp1,
    pub(crate) rsp: Rsp,
    pub(crate) rsp_cp0: RspCp0,
    pub(crate) rsp_cp2: RspCp2,
    pub(crate) rdp: Rdp,

    // Cross-thread collaborators
    pub(crate) save: Arc<Mutex<SaveFile>>,
    pub(crate) frames: Arc<FrameQueue>,
    pub(crate) audio: Arc<AudioOutput>,
    pub(crate) input: Receiver<InputEvent>,
    pub(crate) running: Arc<AtomicBool>,

    expansion_pak: bool,
    fps: Arc<AtomicU32>,
    fps_count: u32,
    last_fps_time: Instant,
}

impl Console {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rom: Vec<u8>,
        pif_rom: Vec<u8>,
        save: Arc<Mutex<SaveFile>>,
        frames: Arc<FrameQueue>,
        audio: Arc<AudioOutput>,
        input: Receiver<InputEvent>,
        running: Arc<AtomicBool>,
        fps: Arc<AtomicU32>,
        config: &Config,
    ) -> Console {
        let memory = Memory::new();
        let raster = Raster::new(memory.rdram.clone(), config.tex_filter != 0);

        let mut console = Console {
            tasks: Vec::new(),
            global_cycles: 0,
            cpu_cycles: 0,
            rsp_cycles: 0,
            cpu_running: true,
            rsp_running: false,
            rom,
            memory,
            mi: Mi::new(),
            pif: Pif::new(&pif_rom),
            ai: Ai::new(),
            vi: Vi::new(),
            pi: Pi::new(),
            si: Si::new(),
            cpu: Cpu::new(),
            cp0: Cp0::new(),
            cp1: Cp1::new(),
            rsp: Rsp::new(),
            rsp_cp0: RspCp0::new(),
            rsp_cp2: RspCp2::new(),
            rdp: Rdp::new(raster, config.threaded_rdp != 0),
            save,
            frames,
            audio,
            input,
            running,
            expansion_pak: config.expansion_pak != 0,
            fps,
            fps_count: 0,
            last_fps_time: Instant::now(),
        };
        console.reset();
        console
    }

    /// Reset the scheduler and every component to its boot state.
    pub fn reset(&mut self) {
        self.cpu_running = true;
        self.rsp_running = false;
        self.tasks.clear();
        self.global_cycles = 0;
        self.cpu_cycles = 0;
        self.rsp_cycles = 0;
        self.schedule(Task::ResetCycles, 0x7FFF_FFFF);

        self.memory.reset(self.expansion_pak);
        self.mi.reset();
        self.pif.reset();
        self.ai_reset();
        self.pi = Pi::new();
        self.si = Si::new();
        self.vi_reset();
        self.rsp.reset();
        self.rsp_cp0.reset();
        self.rsp_cp2.reset();
        self.cp1.reset();
        self.cp0_reset();
        self.cpu_reset();
    }

    /// Run the stepping loop until told to stop: issue CPU and RSP opcodes up
    /// to the next scheduled task, then pop and run everything that's due.
    pub fn run(&mut self) {
        while self.running.load(Ordering::Relaxed) {
            // Run the processors until the next scheduled task
            while self.tasks[0].cycles > self.global_cycles {
                if self.cpu_running && self.global_cycles >= self.cpu_cycles {
                    self.cpu_run_opcode();
                    self.cpu_cycles = self.global_cycles.wrapping_add(2);
                }

                if self.rsp_running && self.global_cycles >= self.rsp_cycles {
                    self.rsp_run_opcode();
                    self.rsp_cycles = self.global_cycles.wrapping_add(3);
                }

                // Jump to the next soonest opcode
                self.global_cycles = u32::min(
                    if self.cpu_running { self.cpu_cycles } else { u32::MAX },
                    if self.rsp_running { self.rsp_cycles } else { u32::MAX },
                );
            }

            // Jump to the next scheduled task and run everything due
            self.global_cycles = self.tasks[0].cycles;
            while self.tasks[0].cycles <= self.global_cycles {
                let task = self.tasks.remove(0).task;
                self.run_task(task);
            }
        }

        self.rdp_finish_worker();
    }

    /// Add a task to the scheduler, sorted by cycles until execution;
    /// equal-time tasks keep their insertion order.
    pub(crate) fn schedule(&mut self, task: Task, cycles: u32) {
        let when = self.global_cycles.wrapping_add(cycles);
        let index = self.tasks.partition_point(|event| event.cycles <= when);
        self.tasks.insert(index, Event { cycles: when, task });
    }

    pub(crate) fn run_task(&mut self, task: Task) {
        match task {
            Task::ResetCycles => self.reset_cycles(),
            Task::UpdateCount => self.cp0_update_count(),
            Task::RaiseInterrupt => self.cp0_interrupt(),
            Task::DrawFrame => self.vi_draw_frame(),
            Task::CreateBuffer => self.ai_create_buffer(),
            Task::ProcessBuffer => self.ai_process_buffer(),
        }
    }

    /// Rebase all cycle counters to prevent 32-bit overflow; relative timing
    /// is unchanged.
    fn reset_cycles(&mut self) {
        self.cp0_reset_cycles();
        for event in &mut self.tasks {
            event.cycles = event.cycles.wrapping_sub(self.global_cycles);
        }
        self.cpu_cycles -= u32::min(self.global_cycles, self.cpu_cycles);
        self.rsp_cycles -= u32::min(self.global_cycles, self.rsp_cycles);
        self.global_cycles = 0;

        // Schedule the next cycle reset
        self.schedule(Task::ResetCycles, 0x7FFF_FFFF);
    }

    /// Safely write a byte of data to the current save.
    pub(crate) fn write_save(&mut self, address: u32, value: u8) {
        let mut save = self.save.lock().unwrap();
        if let Some(byte) = save.data.get_mut(address as usize) {
            *byte = value;
            save.dirty = true;
        }
    }

    /// Count a frame, publishing the rate once per wall-clock second.
    fn count_frame(&mut self) {
        if self.last_fps_time.elapsed().as_secs_f64() >= 1.0 {
            self.fps.store(self.fps_count, Ordering::Relaxed);
            self.fps_count = 0;
            self.last_fps_time = Instant::now();
        } else {
            self.fps_count += 1;
        }
    }
}

/// A console with an empty ROM and detached host handles, for unit tests.
#[cfg(test)]
pub(crate) fn test_console() -> Console {
    let (_tx, rx) = crossbeam_channel::unbounded();
    Console::new(
        vec![0; 0x1000],
        Vec::new(),
        Arc::new(Mutex::new(SaveFile::empty())),
        Arc::new(FrameQueue::default()),
        Arc::new(AudioOutput::default()),
        rx,
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicU32::new(0)),
        &Config::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_fire_in_cycle_order_with_stable_ties() {
        let mut console = test_console();
        console.tasks.clear();
        console.schedule(Task::DrawFrame, 100);
        console.schedule(Task::CreateBuffer, 50);
        console.schedule(Task::ProcessBuffer, 100);

        assert_eq!(console.tasks[0].task, Task::CreateBuffer);
        assert_eq!(console.tasks[1].task, Task::DrawFrame);
        assert_eq!(console.tasks[2].task, Task::ProcessBuffer);
    }

    #[test]
    fn cycle_rebase_preserves_relative_timing() {
        let mut console = test_console();
        console.tasks.clear();
        console.global_cycles = 0x1000;
        console.schedule(Task::DrawFrame, 100);
        console.schedule(Task::CreateBuffer, 300);
        console.cpu_cycles = 0x1002;

        console.reset_cycles();
        assert_eq!(console.global_cycles, 0);
        assert_eq!(console.tasks[0].cycles, 100);
        assert_eq!(console.tasks[0].task, Task::DrawFrame);
        assert_eq!(console.tasks[1].cycles, 300);
        assert_eq!(console.cpu_cycles, 2);
        // The rebase task itself is rescheduled a full period out
        assert!(console.tasks.iter().any(|event| {
            event.task == Task::ResetCycles && event.cycles == 0x7FFF_FFFF
        }));
    }

    #[test]
    fn reset_is_idempotent() {
        let mut console = test_console();
        console.reset();
        let tasks_a = console.tasks.len();
        let status_a = console.cp0_read(12);
        console.reset();
        assert_eq!(console.tasks.len(), tasks_a);
        assert_eq!(console.cp0_read(12), status_a);
        assert_eq!(console.cp0_read(12), 0x40_0004);
        assert!(console.cpu_running);
        assert!(!console.rsp_running);
    }
}
