// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Per-guest virtual GPU.
//!
//! A [`Context`] receives every trapped guest access, keeps a private
//! mirror of the guest's BAR0, and only programs the real GPU after the
//! access has been validated and its addresses rewritten into the guest's
//! VRAM arena. Hardware is only reached while holding the device lock.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
    barrier::{BarrierTable, PageRole, PAGE_SIZE},
    bit_mask::{extract_bytes, BitField},
    channel::{Channel, TableId, BAR1_CHANNEL, BAR3_CHANNEL},
    command::{AccessSize, Aperture, Command},
    device::{self, Device, VramArena},
    playlist::{self, Playlist},
    registers::{
        channel_control, channel_instance, Accessor, ChannelControl, InstancePointer, PollArea,
        RegisterFile, BAR1_INSTANCE, BAR3_INSTANCE, FIFO_CHANNEL_BASE, FIFO_CHANNEL_STRIDE,
        FIFO_PLAYLIST_ADDRESS, FIFO_PLAYLIST_COMMIT, FIFO_POLL_AREA, PBFB_MEM_SIZE_0,
        PBFB_MEM_SIZE_1, PBFB_PART_COUNT, PBFB_PART_MASK, PMC_BOOT_0, POLL_SLOT_SIZE,
        PRAMIN_BASE, PRAMIN_WINDOW, PRAMIN_WINDOW_SIZE, PTIMER_TIME_0, PTIMER_TIME_1,
        VM_FLUSH_TRIGGER, VM_FLUSH_VSPACE,
    },
    shadow_page_table::{
        translate_instance_pd, translate_pte, ShadowPageTable, INSTANCE_PAGE_DIRECTORY,
    },
};

const BAR1_TABLE: TableId = 0;
const BAR3_TABLE: TableId = 1;
const FIRST_CHANNEL_TABLE: TableId = 2;

const PRAMIN_RANGE: std::ops::Range<u64> = PRAMIN_WINDOW..PRAMIN_WINDOW + PRAMIN_WINDOW_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Bar1,
    Bar3,
    Guest(usize),
}

pub struct Context {
    device: Arc<Device>,
    through: bool,
    accepted: bool,
    id: u32,
    domid: Option<u32>,
    arena: VramArena,
    first_channel: u32,
    channels: Vec<Channel>,
    bar1_channel: Channel,
    bar3_channel: Channel,
    tables: Vec<ShadowPageTable>,
    barrier: BarrierTable,
    playlist: Playlist,
    poll_area: Option<u64>,
    registers: RegisterFile,
    result: u32,
}

impl Context {
    pub fn new(device: Arc<Device>, through: bool) -> Self {
        Self {
            device,
            through,
            accepted: false,
            id: 0,
            domid: None,
            arena: VramArena::default(),
            first_channel: 0,
            channels: Vec::new(),
            bar1_channel: Channel::new(BAR1_CHANNEL, BAR1_TABLE),
            bar3_channel: Channel::new(BAR3_CHANNEL, BAR3_TABLE),
            tables: Vec::new(),
            barrier: BarrierTable::default(),
            playlist: Playlist::new([0; 2]),
            poll_area: None,
            registers: RegisterFile::default(),
            result: 0,
        }
    }

    /// Acquires a virtual GPU id and sets up the guest's channels and shadow
    /// tables.
    pub fn accept(&mut self) -> device::Result<()> {
        let id = self.device.acquire_virt()?;
        let guest_channels = self.device.guest_channels();

        self.id = id;
        self.arena = self.device.layout().arena(id);
        self.first_channel = self.device.first_channel(id);
        self.tables = vec![
            ShadowPageTable::new(self.device.bar1_arena_size()),
            ShadowPageTable::new(self.device.bar3_arena_size()),
        ];
        self.tables
            .extend((0..guest_channels).map(|_| ShadowPageTable::new(self.arena.size)));
        self.channels = (0..guest_channels)
            .map(|c| Channel::new(c as i32, FIRST_CHANNEL_TABLE + c as usize))
            .collect();
        self.playlist = Playlist::new(self.device.layout().playlist_slots(id));
        self.barrier = BarrierTable::new(self.arena);
        self.accepted = true;

        info!(
            "Virtual GPU {id}: VRAM {:#x}+{:#x}, channels {}..{}",
            self.arena.base,
            self.arena.size,
            self.first_channel,
            self.first_channel + guest_channels
        );
        Ok(())
    }

    pub const fn id(&self) -> Option<u32> {
        if self.accepted {
            Some(self.id)
        } else {
            None
        }
    }

    pub const fn domid(&self) -> Option<u32> {
        self.domid
    }

    pub const fn arena(&self) -> &VramArena {
        &self.arena
    }

    /// Value produced by the last read.
    pub const fn result(&self) -> u32 {
        self.result
    }

    /// Guest channel `index`, or one of the pseudo-channels.
    pub fn channel(&self, index: i32) -> Option<&Channel> {
        match index {
            BAR1_CHANNEL => Some(&self.bar1_channel),
            BAR3_CHANNEL => Some(&self.bar3_channel),
            _ => usize::try_from(index)
                .ok()
                .and_then(|c| self.channels.get(c)),
        }
    }

    pub fn table(&self, channel: &Channel) -> &ShadowPageTable {
        &self.tables[channel.table()]
    }

    pub const fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub const fn poll_area(&self) -> Option<u64> {
        self.poll_area
    }

    pub fn handle(&mut self, command: &Command) {
        match *command {
            Command::Init { domid } => {
                info!("Guest domain {domid} connected");
                self.domid = Some(domid);
            }
            _ if self.through => self.forward(command),
            _ if !self.accepted => warn!("Dropping {command:?} before accept"),
            Command::Read {
                aperture: Aperture::General,
                offset,
                size,
            } => self.result = self.read_general(offset, size),
            Command::Read {
                aperture: Aperture::Vram,
                offset,
                size,
            } => self.result = self.read_bar1(offset, size),
            Command::Read {
                aperture: Aperture::Instance,
                offset,
                size,
            } => self.result = self.read_bar3(offset, size),
            Command::Write {
                aperture: Aperture::General,
                offset,
                value,
                size,
            } => self.write_general(offset, value, size),
            Command::Write {
                aperture: Aperture::Vram,
                offset,
                value,
                size,
            } => self.write_bar1(offset, value, size),
            Command::Write {
                aperture: Aperture::Instance,
                offset,
                value,
                size,
            } => self.write_bar3(offset, value, size),
        }
    }

    fn forward(&mut self, command: &Command) {
        let mut state = self.device.lock();
        let mut regs = state.registers();
        match *command {
            Command::Read {
                aperture,
                offset,
                size,
            } => self.result = regs.read(aperture, offset, size),
            Command::Write {
                aperture,
                offset,
                value,
                size,
            } => regs.write(aperture, offset, value, size),
            Command::Init { .. } => {}
        }
    }

    fn read_general(&mut self, offset: u64, size: AccessSize) -> u32 {
        if PRAMIN_RANGE.contains(&offset) {
            return self.read_pramin(offset, size);
        }
        let value = match offset & !3 {
            PMC_BOOT_0 | PTIMER_TIME_0 | PTIMER_TIME_1 => {
                return self
                    .device
                    .lock()
                    .registers()
                    .read(Aperture::General, offset, size);
            }
            PBFB_PART_COUNT => 1,
            PBFB_PART_MASK => 0,
            PBFB_MEM_SIZE_0 | PBFB_MEM_SIZE_1 => (self.arena.size >> 20) as u32,
            _ => return self.registers.read(offset, size),
        };
        extract_bytes(u64::from(value), (offset & 3) as u32, size.bytes()) as u32
    }

    fn write_general(&mut self, offset: u64, value: u32, size: AccessSize) {
        if PRAMIN_RANGE.contains(&offset) {
            self.write_pramin(offset, value, size);
            return;
        }
        let reg = offset & !3;
        let value = self.registers.write(offset, value, size);
        let channels_end = channel_instance(self.device.guest_channels());

        match reg {
            BAR1_INSTANCE => {
                self.bind_aperture(Slot::Bar1, InstancePointer::from_bits_retain(value));
            }
            BAR3_INSTANCE => {
                self.bind_aperture(Slot::Bar3, InstancePointer::from_bits_retain(value));
            }
            FIFO_POLL_AREA => self.set_poll_area(PollArea::from_bits_retain(value)),
            FIFO_PLAYLIST_COMMIT => self.commit_playlist(value),
            VM_FLUSH_TRIGGER => self.flush_tlb(value),
            _ if (FIFO_CHANNEL_BASE..channels_end).contains(&reg) => {
                let channel = ((reg - FIFO_CHANNEL_BASE) / FIFO_CHANNEL_STRIDE) as u32;
                if reg & 4 == 0 {
                    self.bind_channel(channel, InstancePointer::from_bits_retain(value));
                } else {
                    self.control_channel(channel, ChannelControl::from_bits_retain(value));
                }
            }
            _ => {}
        }
    }

    /// Host address behind a PRAMIN window access.
    fn pramin_address(&self, offset: u64, size: AccessSize) -> Option<u64> {
        let base = u64::from(self.registers.read32(PRAMIN_BASE)) << 16;
        self.arena
            .translate(base + (offset - PRAMIN_WINDOW), size.bytes().into())
    }

    fn read_pramin(&mut self, offset: u64, size: AccessSize) -> u32 {
        let Some(host) = self.pramin_address(offset, size) else {
            debug!("PRAMIN read at {offset:#x} outside the arena");
            return 0;
        };
        let device = Arc::clone(&self.device);
        let mut state = device.lock();
        self.read_mediated(&mut state.registers(), host, size)
    }

    fn write_pramin(&mut self, offset: u64, value: u32, size: AccessSize) {
        let Some(host) = self.pramin_address(offset, size) else {
            debug!("PRAMIN write at {offset:#x} outside the arena");
            return;
        };
        let device = Arc::clone(&self.device);
        let mut state = device.lock();
        self.write_mediated(&mut state.registers(), host, value, size);
    }

    /// Real BAR1 offset of a guest access to its poll area.
    fn poll_slot(&self, offset: u64) -> Option<u64> {
        let relative = offset.checked_sub(self.poll_area?)?;
        let channel = relative / POLL_SLOT_SIZE;
        (channel < u64::from(self.device.guest_channels())).then(|| {
            (u64::from(self.first_channel) + channel) * POLL_SLOT_SIZE + relative % POLL_SLOT_SIZE
        })
    }

    fn read_bar1(&mut self, offset: u64, size: AccessSize) -> u32 {
        let device = Arc::clone(&self.device);
        let mut state = device.lock();
        if let Some(slot) = self.poll_slot(offset) {
            return state.registers().read(Aperture::Vram, slot, size);
        }
        let host = state.bar1().translate(self.id, offset);
        match host {
            Some(host) => self.read_mediated(&mut state.registers(), host, size),
            None => {
                debug!("BAR1 read at {offset:#x} not mapped");
                0
            }
        }
    }

    fn write_bar1(&mut self, offset: u64, value: u32, size: AccessSize) {
        let device = Arc::clone(&self.device);
        let mut state = device.lock();
        if let Some(slot) = self.poll_slot(offset) {
            state.registers().write(Aperture::Vram, slot, value, size);
            return;
        }
        let host = state.bar1().translate(self.id, offset);
        match host {
            Some(host) => self.write_mediated(&mut state.registers(), host, value, size),
            None => debug!("BAR1 write at {offset:#x} not mapped"),
        }
    }

    fn read_bar3(&mut self, offset: u64, size: AccessSize) -> u32 {
        let Some(host) = self.tables[BAR3_TABLE].resolve(offset) else {
            debug!("BAR3 read at {offset:#x} not mapped");
            return 0;
        };
        let device = Arc::clone(&self.device);
        let mut state = device.lock();
        self.read_mediated(&mut state.registers(), host, size)
    }

    fn write_bar3(&mut self, offset: u64, value: u32, size: AccessSize) {
        let Some(host) = self.tables[BAR3_TABLE].resolve(offset) else {
            debug!("BAR3 write at {offset:#x} not mapped");
            return;
        };
        let device = Arc::clone(&self.device);
        let mut state = device.lock();
        self.write_mediated(&mut state.registers(), host, value, size);
    }

    /// VRAM read that sees guest values on barrier pages.
    fn read_mediated(&self, regs: &mut Accessor, host: u64, size: AccessSize) -> u32 {
        self.barrier
            .read(host, size)
            .unwrap_or_else(|| regs.read_vram(host, size))
    }

    /// VRAM write that keeps barrier pages translated.
    fn write_mediated(&mut self, regs: &mut Accessor, host: u64, value: u32, size: AccessSize) {
        let Some(role) = self.barrier.role(host) else {
            regs.write_vram(host, value, size);
            return;
        };
        let location = host & !7;
        let page = host & !(PAGE_SIZE - 1);
        let raw = self.barrier.write(regs, host, value, size).unwrap_or(0);

        match role {
            PageRole::Table(page_size) => {
                let entry = translate_pte(raw, &self.arena, page_size);
                for table in self.tables.iter_mut().filter(|t| t.holds(page)) {
                    table.update_entry(location, entry);
                }
            }
            PageRole::Directory => {
                let owners: Vec<TableId> = self
                    .tables
                    .iter()
                    .enumerate()
                    .filter(|(_, table)| {
                        table
                            .directory_range()
                            .is_some_and(|range| range.contains(&location))
                    })
                    .map(|(id, _)| id)
                    .collect();
                for table in owners {
                    self.reload(regs, table);
                }
            }
            PageRole::Instance => {
                if location - page != INSTANCE_PAGE_DIRECTORY {
                    return;
                }
                let users: Vec<TableId> = self
                    .all_channels()
                    .filter(|c| c.instance() == Some(page))
                    .map(Channel::table)
                    .collect();
                for table in users {
                    self.load_instance(regs, table, page);
                }
            }
        }
    }

    fn all_channels(&self) -> impl Iterator<Item = &Channel> {
        [&self.bar1_channel, &self.bar3_channel]
            .into_iter()
            .chain(self.channels.iter())
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Channel {
        match slot {
            Slot::Bar1 => &mut self.bar1_channel,
            Slot::Bar3 => &mut self.bar3_channel,
            Slot::Guest(c) => &mut self.channels[c],
        }
    }

    /// Points the table of `table` at the address space of `instance` and
    /// writes the instance's directory pointer in host form, or as null if
    /// the directory cannot be shadowed.
    fn load_instance(&mut self, regs: &mut Accessor, table: TableId, instance: u64) {
        let location = instance + INSTANCE_PAGE_DIRECTORY;
        let raw = self.barrier.raw(location).unwrap_or(0);
        let pd = translate_instance_pd(raw, &self.arena).filter(|pd| {
            self.tables[table].refresh_page_directories(
                &self.arena,
                &mut self.barrier,
                regs,
                pd.bit_clear::<12>(),
            )
        });
        if pd.is_none() {
            if raw != 0 {
                debug!("instance {instance:#x}: page directory {raw:#x} not shadowed");
            }
            self.tables[table].clear(&mut self.barrier, regs);
        }
        regs.write_vram64(location, pd.unwrap_or(0));
    }

    /// Re-walks `table` from the instance block it is bound through.
    fn reload(&mut self, regs: &mut Accessor, table: TableId) {
        let instance = self
            .all_channels()
            .find(|c| c.table() == table)
            .and_then(Channel::instance);
        match instance {
            Some(instance) => self.load_instance(regs, table, instance),
            None => self.tables[table].clear(&mut self.barrier, regs),
        }
    }

    /// Binds `slot` to the instance block `pointer` names. Returns the host
    /// instance address, or `None` if the slot ends up unbound.
    fn bind_instance(
        &mut self,
        regs: &mut Accessor,
        slot: Slot,
        pointer: InstancePointer,
    ) -> Option<u64> {
        let mut host = if pointer.contains(InstancePointer::VALID) {
            let host = self.arena.translate(pointer.address(), PAGE_SIZE);
            if host.is_none() {
                warn!("Instance {:#x} outside the arena", pointer.address());
            }
            host
        } else {
            None
        };
        if let Some(page) = host {
            if !self.barrier.adopt(regs, page, PageRole::Instance) {
                warn!("Instance {:#x} already shadowed in another role", pointer.address());
                host = None;
            }
        }

        let channel = self.slot_mut(slot);
        let previous = channel.instance();
        let table = channel.table();
        channel.bind(host);

        if let Some(previous) = previous {
            self.barrier.release(regs, previous);
        }
        match host {
            Some(host) => self.load_instance(regs, table, host),
            None => self.tables[table].clear(&mut self.barrier, regs),
        }
        host
    }

    fn bind_aperture(&mut self, slot: Slot, pointer: InstancePointer) {
        let device = Arc::clone(&self.device);
        let mut state = device.lock();
        self.bind_instance(&mut state.registers(), slot, pointer);
        if slot == Slot::Bar1 {
            let bar1 = state.bar1();
            bar1.shadow(self.id, &self.tables[BAR1_TABLE], device.bar1_arena_size());
            bar1.flush();
        }
    }

    fn bind_channel(&mut self, channel: u32, pointer: InstancePointer) {
        let device = Arc::clone(&self.device);
        let mut state = device.lock();
        let mut regs = state.registers();
        let host = self.bind_instance(&mut regs, Slot::Guest(channel as usize), pointer);
        let value = match host {
            Some(host) => pointer.with_address(host),
            None if pointer.contains(InstancePointer::VALID) => return,
            None => pointer.with_address(0),
        };
        regs.write32(channel_instance(self.first_channel + channel), value.bits());
    }

    fn control_channel(&mut self, channel: u32, control: ChannelControl) {
        self.channels[channel as usize].set_enabled(control.contains(ChannelControl::ENABLE));
        self.device
            .lock()
            .registers()
            .write32(channel_control(self.first_channel + channel), control.bits());
    }

    fn set_poll_area(&mut self, poll: PollArea) {
        self.poll_area = poll.contains(PollArea::VALID).then_some(poll.address());
        debug!("Virtual GPU {}: poll area {:?}", self.id, self.poll_area);
    }

    fn commit_playlist(&mut self, value: u32) {
        let count = value.bit_mask::<8>();
        let address =
            u64::from(self.registers.read32(FIFO_PLAYLIST_ADDRESS).bit_mask::<28>()) << 12;
        let Some(host) = self
            .arena
            .translate(address, u64::from(count) * playlist::ENTRY_SIZE)
        else {
            warn!("Virtual GPU {}: playlist {address:#x} outside the arena", self.id);
            return;
        };

        let mut state = self.device.lock();
        let (shadow, shadow_count) = self.playlist.update(
            &mut state.registers(),
            &self.channels,
            self.first_channel,
            host,
            count,
        );
        if state.try_acquire_gpu(self.id) {
            debug!("Virtual GPU {} now owns the GPU", self.id);
        }
        let value = if shadow_count == count {
            value
        } else {
            value.bit_clear::<8>() | shadow_count
        };
        let mut regs = state.registers();
        regs.write32(FIFO_PLAYLIST_ADDRESS, (shadow >> 12) as u32);
        regs.write32(FIFO_PLAYLIST_COMMIT, value);
    }

    fn flush_tlb(&mut self, trigger: u32) {
        let vspace = self.registers.read32(VM_FLUSH_VSPACE);
        let address = u64::from(vspace.bit_field::<4, 28>()) << 12;
        let Some(page_directory) = self.arena.translate(address, 8) else {
            warn!("Virtual GPU {}: TLB flush of {address:#x} outside the arena", self.id);
            return;
        };
        let adjusted = vspace.bit_mask::<4>() | (page_directory >> 8) as u32;

        let device = Arc::clone(&self.device);
        let mut state = device.lock();
        let candidates: Vec<TableId> = [BAR1_TABLE, BAR3_TABLE]
            .into_iter()
            .chain(self.channels.iter().filter(|c| c.enabled()).map(Channel::table))
            .filter(|t| self.tables[*t].page_directory_address() == Some(page_directory))
            .collect();

        let mut regs = state.registers();
        for table in &candidates {
            self.reload(&mut regs, *table);
        }

        let bar1 = candidates.contains(&BAR1_TABLE);
        if bar1 {
            let bar1_shadow = state.bar1();
            bar1_shadow.shadow(self.id, &self.tables[BAR1_TABLE], device.bar1_arena_size());
            bar1_shadow.flush();
            if candidates.len() == 1 {
                return;
            }
        }

        let mut regs = state.registers();
        regs.write32(VM_FLUSH_VSPACE, adjusted);
        regs.write32(VM_FLUSH_TRIGGER, trigger);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.accepted {
            return;
        }
        {
            let device = Arc::clone(&self.device);
            let mut state = device.lock();
            self.barrier.release_all(&mut state.registers());
        }
        if let Err(e) = self.device.release_virt(self.id) {
            warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use mockall::{predicate::eq, Sequence};

    use super::*;
    use crate::{
        bit_mask::{lower_32_bits, upper_32_bits},
        hardware::MockHardware,
        shadow_page_table::{entry_address, MAX_VM_LIMIT},
        testutils::{
            assert_isolated, emulated_device, emulated_device_with_log, pde, pte, read,
            test_config, write, GUEST_VRAM,
        },
    };

    fn accepted(device: &Arc<Device>) -> Context {
        let mut context = Context::new(Arc::clone(device), false);
        context.accept().unwrap();
        context
    }

    /// Guest-physical layout used by the address space tests.
    const INSTANCE: u64 = 0x1_0000;
    const PAGE_DIRECTORY: u64 = 0x2_0000;
    const SMALL_TABLE: u64 = 0x10_0000;

    fn guest_write64(context: &Context, gphys: u64, value: u64) {
        let host = context.arena().translate(gphys, 8).unwrap();
        let mut state = context.device.lock();
        state.registers().write_vram64(host, value);
    }

    fn vram64(context: &Context, host: u64) -> u64 {
        context.device.lock().registers().read_vram64(host)
    }

    /// Instance at INSTANCE, its directory at PAGE_DIRECTORY mapping va
    /// `0x1000 * i` to `target + 0x1000 * i` for every `i` in `pages`.
    fn build_address_space(context: &mut Context, target: u64, pages: u64) {
        guest_write64(context, INSTANCE + INSTANCE_PAGE_DIRECTORY, PAGE_DIRECTORY);
        guest_write64(context, PAGE_DIRECTORY, pde(Some(SMALL_TABLE), None));
        for i in 0..pages {
            guest_write64(context, SMALL_TABLE + i * 8, pte(target + i * 0x1000));
        }
    }

    fn bind_pointer(gphys: u64) -> u32 {
        InstancePointer::VALID.with_address(gphys).bits()
    }

    #[test]
    fn test_commands_before_accept_are_dropped() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = Context::new(device, false);

        context.handle(&Command::Init { domid: 7 });
        context.handle(&write(Aperture::General, 0x2274, 1));
        assert_eq!(context.domid(), Some(7));
        assert_eq!(context.id(), None);
        assert!(log.writes().is_empty());
    }

    #[test]
    fn test_accept_exhaustion() {
        let device = emulated_device(&test_config(1));
        let _first = accepted(&device);
        let mut second = Context::new(Arc::clone(&device), false);
        assert_eq!(
            second.accept(),
            Err(crate::device::Error::VirtIdsExhausted(1))
        );
    }

    #[test]
    fn test_drop_releases_id() {
        let device = emulated_device(&test_config(1));
        {
            let context = accepted(&device);
            assert_eq!(context.id(), Some(0));
        }
        assert_eq!(device.lock().virt_ids_in_use(), 0);
        assert_eq!(accepted(&device).id(), Some(0));
    }

    #[test]
    fn test_through_mode_forwards_verbatim() {
        let mut hw = MockHardware::new();
        let mut seq = Sequence::new();
        hw.expect_write()
            .with(eq(Aperture::General), eq(0x2274), eq(0x1f0_0003), eq(AccessSize::Dword))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        hw.expect_read()
            .with(eq(Aperture::Vram), eq(0x40), eq(AccessSize::Word))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(0xbeefu32);
        let device = Arc::new(Device::new(&test_config(4), Box::new(hw)));

        let mut context = Context::new(device, true);
        context.handle(&write(Aperture::General, 0x2274, 0x1f0_0003));
        context.handle(&Command::Read {
            aperture: Aperture::Vram,
            offset: 0x40,
            size: AccessSize::Word,
        });
        assert_eq!(context.result(), 0xbeef);
    }

    #[test]
    fn test_bar0_mirror_and_partition_registers() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);

        context.handle(&write(Aperture::General, 0x8000, 0x1234_5678));
        context.handle(&Command::Write {
            aperture: Aperture::General,
            offset: 0x8002,
            value: 0xab,
            size: AccessSize::Byte,
        });
        assert_eq!(read(&mut context, Aperture::General, 0x8000), 0x12ab_5678);
        assert!(log.values_at(0x8000).is_empty());

        assert_eq!(read(&mut context, Aperture::General, PBFB_PART_COUNT), 1);
        assert_eq!(read(&mut context, Aperture::General, PBFB_PART_MASK), 0);
        assert_eq!(
            read(&mut context, Aperture::General, PBFB_MEM_SIZE_0),
            (GUEST_VRAM >> 20) as u32
        );
    }

    #[test]
    fn test_hardware_registers_read_through() {
        let device = emulated_device(&test_config(4));
        device
            .lock()
            .registers()
            .write32(PMC_BOOT_0, 0x0c00_00a1);
        let mut context = accepted(&device);
        assert_eq!(read(&mut context, Aperture::General, PMC_BOOT_0), 0x0c00_00a1);
    }

    #[test]
    fn test_pramin_window() {
        let device = emulated_device(&test_config(4));
        let _first = accepted(&device);
        let mut context = accepted(&device);
        let arena = *context.arena();

        // window at guest 0x30000
        context.handle(&write(Aperture::General, PRAMIN_BASE, 0x3));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 0x10, 0xcafe));
        assert_eq!(
            context.device.lock().registers().read_vram32(arena.base + 0x3_0010),
            0xcafe
        );
        assert_eq!(read(&mut context, Aperture::General, PRAMIN_WINDOW + 0x10), 0xcafe);

        // past the arena
        context.handle(&write(Aperture::General, PRAMIN_BASE, (GUEST_VRAM >> 16) as u32));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW, 0x1));
        assert_eq!(
            context.device.lock().registers().read_vram32(arena.base + GUEST_VRAM),
            0
        );
        assert_eq!(read(&mut context, Aperture::General, PRAMIN_WINDOW), 0);
    }

    #[test]
    fn test_channel_bind_and_enable() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let _first = accepted(&device);
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 4);

        context.handle(&write(Aperture::General, channel_instance(3), bind_pointer(INSTANCE)));
        context.handle(&write(Aperture::General, channel_control(3), 0x1));

        // physical channel 32 + 3 got host addresses
        assert_eq!(
            log.values_at(channel_instance(35)),
            vec![bind_pointer(arena.base + INSTANCE)]
        );
        assert_eq!(log.values_at(channel_control(35)), vec![0x1]);
        // guest still reads its own value
        assert_eq!(
            read(&mut context, Aperture::General, channel_instance(3)),
            bind_pointer(INSTANCE)
        );

        let channel = context.channel(3).unwrap();
        assert!(channel.enabled());
        assert_eq!(channel.instance(), Some(arena.base + INSTANCE));
        let table = context.table(channel);
        assert_eq!(table.page_directory_address(), Some(arena.base + PAGE_DIRECTORY));
        assert_eq!(table.resolve(0x2008), Some(arena.base + 0x40_2008));

        // instance block holds the host directory, the guest sees its own
        assert_eq!(
            vram64(&context, arena.base + INSTANCE + INSTANCE_PAGE_DIRECTORY),
            arena.base + PAGE_DIRECTORY
        );
        context.handle(&write(Aperture::General, PRAMIN_BASE, 0x1));
        assert_eq!(
            read(&mut context, Aperture::General, PRAMIN_WINDOW + INSTANCE_PAGE_DIRECTORY),
            PAGE_DIRECTORY as u32
        );
    }

    #[test]
    fn test_channel_bind_outside_arena_is_dropped() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);

        context.handle(&write(Aperture::General, channel_instance(0), bind_pointer(GUEST_VRAM)));
        assert!(log.values_at(channel_instance(0)).is_empty());
        assert_eq!(context.channel(0).unwrap().instance(), None);

        // unbinding forwards the flags without an address
        context.handle(&write(Aperture::General, channel_instance(0), 0x0000_1234));
        assert_eq!(log.values_at(channel_instance(0)), vec![0]);
    }

    #[test]
    fn test_unbind_writes_guest_values_back() {
        let device = emulated_device(&test_config(4));
        let _first = accepted(&device);
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 1);

        context.handle(&write(Aperture::General, channel_instance(0), bind_pointer(INSTANCE)));
        assert_ne!(vram64(&context, arena.base + SMALL_TABLE), pte(0x40_0000));

        context.handle(&write(Aperture::General, channel_instance(0), 0));
        assert_eq!(vram64(&context, arena.base + SMALL_TABLE), pte(0x40_0000));
        assert_eq!(
            vram64(&context, arena.base + INSTANCE + INSTANCE_PAGE_DIRECTORY),
            PAGE_DIRECTORY
        );
        assert!(context.barrier.is_empty());
    }

    #[test]
    fn test_page_table_write_through_pramin() {
        let device = emulated_device(&test_config(4));
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 1);
        context.handle(&write(Aperture::General, channel_instance(0), bind_pointer(INSTANCE)));

        // map va 0x1000 through the window onto the small table
        context.handle(&write(Aperture::General, PRAMIN_BASE, (SMALL_TABLE >> 16) as u32));
        let entry = pte(0x50_0000);
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 8, entry as u32));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 12, (entry >> 32) as u32));

        let table = context.table(context.channel(0).unwrap());
        assert_eq!(table.resolve(0x1000), Some(arena.base + 0x50_0000));
        assert_eq!(
            read(&mut context, Aperture::General, PRAMIN_WINDOW + 8),
            entry as u32
        );

        // an entry pointing outside the arena is never mapped
        let bad = pte(GUEST_VRAM);
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 16, bad as u32));
        let table = context.table(context.channel(0).unwrap());
        assert_eq!(table.resolve(0x2000), None);
        assert_eq!(vram64(&context, arena.base + SMALL_TABLE + 16), 0);
    }

    #[test]
    fn test_page_directory_write_rewalks_tables() {
        let device = emulated_device(&test_config(4));
        let _first = accepted(&device);
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 1);
        context.handle(&write(Aperture::General, channel_instance(0), bind_pointer(INSTANCE)));
        let held = context.barrier.len();

        // drop the small table from the directory
        context.handle(&write(Aperture::General, PRAMIN_BASE, (PAGE_DIRECTORY >> 16) as u32));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 4, 0));

        let table = context.table(context.channel(0).unwrap());
        assert_eq!(table.resolve(0), None);
        assert_eq!(vram64(&context, arena.base + PAGE_DIRECTORY), 0);
        // small table pages were written back
        assert!(context.barrier.len() < held);
        assert_eq!(vram64(&context, arena.base + SMALL_TABLE), pte(0x40_0000));
    }

    #[test]
    fn test_directory_entries_past_the_address_space() {
        let device = emulated_device(&test_config(4));
        let _first = accepted(&device);
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 1);
        context.handle(&write(Aperture::General, channel_instance(0), bind_pointer(INSTANCE)));

        context.handle(&write(Aperture::General, PRAMIN_BASE, (PAGE_DIRECTORY >> 16) as u32));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 8, pde(None, Some(0)) as u32));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 0x10, pde(None, Some(GUEST_VRAM)) as u32));
        assert_eq!(entry_address(vram64(&context, arena.base + PAGE_DIRECTORY + 8)), arena.base);
        assert_eq!(vram64(&context, arena.base + PAGE_DIRECTORY + 0x10), 0);

        context.handle(&write(Aperture::General, PRAMIN_BASE, (INSTANCE >> 16) as u32));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 0x208, u32::MAX));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 0x20c, u32::MAX));
        assert_eq!(vram64(&context, arena.base + INSTANCE + 0x208), MAX_VM_LIMIT);
        assert_eq!(read(&mut context, Aperture::General, PRAMIN_WINDOW + 0x20c), u32::MAX);

        assert_isolated(&mut context.device.lock().registers(), &context.barrier, &arena);
    }

    #[test]
    fn test_instance_block_refused_as_page_table() {
        let device = emulated_device(&test_config(4));
        let _first = accepted(&device);
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 1);
        // large page table on top of the instance block
        guest_write64(&context, PAGE_DIRECTORY, pde(Some(SMALL_TABLE), Some(INSTANCE)));
        context.handle(&write(Aperture::General, channel_instance(0), bind_pointer(INSTANCE)));

        assert_eq!(context.barrier.role(arena.base + INSTANCE), Some(PageRole::Instance));
        let directory = vram64(&context, arena.base + PAGE_DIRECTORY);
        assert_eq!(lower_32_bits(directory), 0);
        assert_eq!(
            entry_address(u64::from(upper_32_bits(directory))),
            arena.base + SMALL_TABLE
        );

        context.handle(&write(Aperture::General, PRAMIN_BASE, (INSTANCE >> 16) as u32));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 0x10, pte(0) as u32));
        let table = context.table(context.channel(0).unwrap());
        assert_eq!(table.resolve(0), Some(arena.base + 0x40_0000));
        assert_eq!(table.resolve(0x4_0000), None);

        assert_isolated(&mut context.device.lock().registers(), &context.barrier, &arena);
    }

    #[test]
    fn test_instance_directory_shared_with_table_is_nulled() {
        let device = emulated_device(&test_config(4));
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 1);
        context.handle(&write(Aperture::General, channel_instance(0), bind_pointer(INSTANCE)));

        // channel 1 names the small table of channel 0 as its directory
        guest_write64(&context, 0x3_0000 + INSTANCE_PAGE_DIRECTORY, SMALL_TABLE);
        context.handle(&write(Aperture::General, channel_instance(1), bind_pointer(0x3_0000)));

        assert_eq!(vram64(&context, arena.base + 0x3_0000 + INSTANCE_PAGE_DIRECTORY), 0);
        let table = context.table(context.channel(1).unwrap());
        assert_eq!(table.page_directory_address(), None);
        context.handle(&write(Aperture::General, PRAMIN_BASE, 0x3));
        assert_eq!(
            read(&mut context, Aperture::General, PRAMIN_WINDOW + INSTANCE_PAGE_DIRECTORY),
            SMALL_TABLE as u32
        );
        assert_isolated(&mut context.device.lock().registers(), &context.barrier, &arena);
    }

    #[test]
    fn test_bar1_and_bar3_apertures() {
        let device = emulated_device(&test_config(4));
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 2);

        context.handle(&write(Aperture::General, BAR1_INSTANCE, bind_pointer(INSTANCE)));
        context.handle(&write(Aperture::General, BAR3_INSTANCE, bind_pointer(INSTANCE)));

        context.handle(&write(Aperture::Vram, 0x1004, 0x55));
        assert_eq!(
            context.device.lock().registers().read_vram32(arena.base + 0x40_1004),
            0x55
        );
        assert_eq!(read(&mut context, Aperture::Instance, 0x1004), 0x55);
        assert_eq!(read(&mut context, Aperture::Vram, 0x2000), 0);
        assert_eq!(read(&mut context, Aperture::Instance, 0x2000), 0);
    }

    #[test]
    fn test_poll_area() {
        let device = emulated_device(&test_config(4));
        let _first = accepted(&device);
        let mut context = accepted(&device);

        // poll area at BAR1 0x100000
        context.handle(&write(Aperture::General, FIFO_POLL_AREA, 0x1000_0100));
        assert_eq!(context.poll_area(), Some(0x10_0000));

        context.handle(&write(Aperture::Vram, 0x10_2010, 0x77));
        // guest channel 2 of virtual GPU 1 is physical channel 34
        assert_eq!(
            context
                .device
                .lock()
                .registers()
                .read(Aperture::Vram, 34 * 0x1000 + 0x10, AccessSize::Dword),
            0x77
        );
        assert_eq!(read(&mut context, Aperture::Vram, 0x10_2010), 0x77);
    }

    fn enable_channels(context: &mut Context, channels: &[u64]) {
        for c in channels {
            context.handle(&write(Aperture::General, channel_control(*c as u32), 0x1));
        }
    }

    fn write_guest_playlist(context: &mut Context, gphys: u64, channels: &[u32]) {
        for (i, c) in channels.iter().enumerate() {
            guest_write64(context, gphys + i as u64 * 8, u64::from(*c));
        }
    }

    #[test]
    fn test_playlist_scenario() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let others: Vec<_> = (0..3).map(|_| accepted(&device)).collect();
        let mut context = accepted(&device);
        assert_eq!(context.id(), Some(3));
        drop(others);

        enable_channels(&mut context, &[2, 5]);
        write_guest_playlist(&mut context, 0x8000, &[5, 2]);
        log.clear();

        context.handle(&write(Aperture::General, FIFO_PLAYLIST_ADDRESS, 0x8));
        context.handle(&write(Aperture::General, FIFO_PLAYLIST_COMMIT, 0x2));

        let slots = device.layout().playlist_slots(3);
        assert_eq!(log.values_at(FIFO_PLAYLIST_ADDRESS), vec![(slots[0] >> 12) as u32]);
        assert_eq!(log.values_at(FIFO_PLAYLIST_COMMIT), vec![0x2]);
        assert_eq!(context.playlist().entries(), &[2, 5]);
        assert_eq!(
            Playlist::decode(&mut device.lock().registers(), slots[0], 2),
            vec![96 + 2, 96 + 5]
        );
        assert_eq!(device.lock().scheduler().owner(), Some(3));

        // the address and commit registers were written back to back
        let writes = log.writes();
        assert_eq!(writes[writes.len() - 2].offset, FIFO_PLAYLIST_ADDRESS);
        assert_eq!(writes[writes.len() - 1].offset, FIFO_PLAYLIST_COMMIT);
    }

    #[test]
    fn test_playlist_count_rewritten_when_filtered() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);
        enable_channels(&mut context, &[1]);
        write_guest_playlist(&mut context, 0x8000, &[1, 4, 1]);

        context.handle(&write(Aperture::General, FIFO_PLAYLIST_ADDRESS, 0x8));
        context.handle(&write(Aperture::General, FIFO_PLAYLIST_COMMIT, 0x0010_0003));
        assert_eq!(log.values_at(FIFO_PLAYLIST_COMMIT), vec![0x0010_0001]);

        // a second commit lands in the other slot
        context.handle(&write(Aperture::General, FIFO_PLAYLIST_COMMIT, 0x0010_0001));
        let slots = device.layout().playlist_slots(0);
        assert_eq!(
            log.values_at(FIFO_PLAYLIST_ADDRESS),
            vec![(slots[0] >> 12) as u32, (slots[1] >> 12) as u32]
        );
    }

    #[test]
    fn test_stale_slot_entries_stay_past_the_count() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);
        enable_channels(&mut context, &[0, 1, 2]);
        write_guest_playlist(&mut context, 0x8000, &[0, 1, 2]);
        context.handle(&write(Aperture::General, FIFO_PLAYLIST_ADDRESS, 0x8));
        context.handle(&write(Aperture::General, FIFO_PLAYLIST_COMMIT, 0x3));
        context.handle(&write(Aperture::General, FIFO_PLAYLIST_COMMIT, 0x3));

        write_guest_playlist(&mut context, 0x8000, &[0, 6, 7]);
        context.handle(&write(Aperture::General, FIFO_PLAYLIST_COMMIT, 0x3));

        let slots = device.layout().playlist_slots(0);
        assert_eq!(
            log.values_at(FIFO_PLAYLIST_ADDRESS).last(),
            Some(&((slots[0] >> 12) as u32))
        );
        assert_eq!(log.values_at(FIFO_PLAYLIST_COMMIT), vec![0x3, 0x3, 0x1]);
        assert_eq!(
            Playlist::decode(&mut device.lock().registers(), slots[0], 3),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_playlist_outside_arena_is_dropped() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);

        context.handle(&write(
            Aperture::General,
            FIFO_PLAYLIST_ADDRESS,
            (GUEST_VRAM >> 12) as u32,
        ));
        context.handle(&write(Aperture::General, FIFO_PLAYLIST_COMMIT, 0x1));
        assert!(log.values_at(FIFO_PLAYLIST_COMMIT).is_empty());
        assert_eq!(device.lock().scheduler().owner(), None);
    }

    fn flush(context: &mut Context, page_directory: u64) {
        let vspace = ((page_directory >> 12) << 4) as u32 | 0x1;
        context.handle(&write(Aperture::General, VM_FLUSH_VSPACE, vspace));
        context.handle(&write(Aperture::General, VM_FLUSH_TRIGGER, 0x8000_0001));
    }

    #[test]
    fn test_tlb_flush_bar1_only() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 1);
        context.handle(&write(Aperture::General, BAR1_INSTANCE, bind_pointer(INSTANCE)));
        assert_eq!(read(&mut context, Aperture::Vram, 0x1000), 0);

        // map BAR1 page 1 behind the mediator's back, then flush
        context.handle(&write(Aperture::General, PRAMIN_BASE, (SMALL_TABLE >> 16) as u32));
        let entry = pte(0x41_0000);
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 8, entry as u32));
        context.handle(&write(Aperture::General, PRAMIN_WINDOW + 12, (entry >> 32) as u32));
        assert_eq!(read(&mut context, Aperture::Vram, 0x1000), 0);

        flush(&mut context, PAGE_DIRECTORY);
        assert!(log.values_at(VM_FLUSH_VSPACE).is_empty());
        assert!(log.values_at(VM_FLUSH_TRIGGER).is_empty());

        context
            .device
            .lock()
            .registers()
            .write_vram32(arena.base + 0x41_0000, 0x99);
        assert_eq!(read(&mut context, Aperture::Vram, 0x1000), 0x99);
    }

    #[test]
    fn test_tlb_flush_general_channel() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);
        let arena = *context.arena();
        build_address_space(&mut context, 0x40_0000, 1);
        context.handle(&write(Aperture::General, BAR1_INSTANCE, bind_pointer(INSTANCE)));
        context.handle(&write(Aperture::General, channel_instance(4), bind_pointer(INSTANCE)));
        enable_channels(&mut context, &[4]);

        flush(&mut context, PAGE_DIRECTORY);
        let adjusted = ((arena.base + PAGE_DIRECTORY) >> 8) as u32 | 0x1;
        assert_eq!(log.values_at(VM_FLUSH_VSPACE), vec![adjusted]);
        assert_eq!(log.values_at(VM_FLUSH_TRIGGER), vec![0x8000_0001]);
        let writes = log.writes();
        assert_eq!(writes[writes.len() - 2].offset, VM_FLUSH_VSPACE);
    }

    #[test]
    fn test_tlb_flush_without_match_is_forwarded() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);
        let arena = *context.arena();

        flush(&mut context, 0x5_0000);
        assert_eq!(
            log.values_at(VM_FLUSH_VSPACE),
            vec![((arena.base + 0x5_0000) >> 8) as u32 | 0x1]
        );
    }

    #[test]
    fn test_tlb_flush_outside_arena_is_dropped() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);

        flush(&mut context, GUEST_VRAM);
        assert!(log.values_at(VM_FLUSH_TRIGGER).is_empty());
    }

    #[test]
    fn test_disabled_channel_not_refreshed_by_flush() {
        let (device, log) = emulated_device_with_log(&test_config(4));
        let mut context = accepted(&device);
        build_address_space(&mut context, 0x40_0000, 1);
        context.handle(&write(Aperture::General, channel_instance(1), bind_pointer(INSTANCE)));

        // change the mapping, flush while channel 1 is disabled
        // written behind the barrier, so only a refresh would pick it up
        guest_write64(&context, SMALL_TABLE + 8, pte(0x60_0000));
        flush(&mut context, PAGE_DIRECTORY);
        let table = context.table(context.channel(1).unwrap());
        assert_eq!(table.resolve(0x1000), None);
        assert_eq!(log.values_at(VM_FLUSH_TRIGGER).len(), 1);
    }

    #[test]
    fn test_commit_writes_address_before_count() {
        let mut hw = MockHardware::new();
        let mut seq = Sequence::new();
        // the guest list reads as disabled channel 0
        hw.expect_read_vram().return_const(0u32);
        hw.expect_write()
            .with(
                eq(Aperture::General),
                eq(FIFO_PLAYLIST_ADDRESS),
                eq(0x4000u32),
                eq(AccessSize::Dword),
            )
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        hw.expect_write()
            .with(
                eq(Aperture::General),
                eq(FIFO_PLAYLIST_COMMIT),
                eq(0u32),
                eq(AccessSize::Dword),
            )
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        let device = Arc::new(Device::new(&test_config(4), Box::new(hw)));
        let mut context = accepted(&device);

        context.handle(&write(Aperture::General, FIFO_PLAYLIST_ADDRESS, 0x8));
        context.handle(&write(Aperture::General, FIFO_PLAYLIST_COMMIT, 0x1));
    }
}
