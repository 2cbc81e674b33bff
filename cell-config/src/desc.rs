// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arrayvec::{ArrayString, ArrayVec};
use cell_abi::{ConsoleDesc, CONSOLE_DESC_SIZE};
use flagset::{flags, FlagSet};
use resource_set::{Cpu, FabricRegion, RemoteCore, ResourceClass, ResourceSet, MAX_BITMAP_BYTES};

use crate::codec::{Reader, Writer};
use crate::error::*;
use crate::memory::{MemoryRegion, MEMORY_REGION_SIZE, PAGE_SIZE};

/// Signature of a partition descriptor.
pub const CELL_DESC_SIGNATURE: [u8; 5] = *b"CVCEL";
/// Layout revision of partition descriptors and system configurations.
pub const CONFIG_REVISION: u16 = 3;
/// Size of the fixed descriptor header.
pub const CELL_DESC_HEADER_SIZE: usize = 96 + CONSOLE_DESC_SIZE;
/// Size of the name field; names are NUL terminated within it.
pub const CELL_NAME_FIELD_SIZE: usize = 32;
/// Longest partition name.
pub const CELL_NAME_MAX: usize = CELL_NAME_FIELD_SIZE - 1;
/// Largest configuration the hypervisor reads.
pub const MAX_CONFIG_SIZE: u64 = 16 * PAGE_SIZE;

pub const MAX_MEM_REGIONS: usize = 64;
pub const MAX_IRQCHIPS: usize = 8;
pub const MAX_PCI_DEVICES: usize = 32;
pub const MAX_RCPU_DEVICES: usize = 16;
pub const MAX_FABRIC_DEVICES: usize = 16;

const IRQCHIP_SIZE: usize = 32;
const PCI_DEVICE_SIZE: usize = 16;
const RCPU_DEVICE_SIZE: usize = 104;
const FABRIC_DEVICE_SIZE: usize = 112;

/// Target architecture of a configuration.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    X86 = 0,
    Arm = 1,
    Arm64 = 2,
    RiscV64 = 3,
}

impl Architecture {
    pub(crate) fn from_raw(raw: u8) -> Result<Self> {
        use Architecture::*;
        match raw {
            0 => Ok(X86),
            1 => Ok(Arm),
            2 => Ok(Arm64),
            3 => Ok(RiscV64),
            _ => Err(Error::UnknownArchitecture(raw)),
        }
    }
}

flags! {
    /// Partition-wide flags.
    pub enum CellFlag: u32 {
        /// The partition never answers messages; requests are treated as approved.
        PassiveCommRegion = 0x1,
        /// The partition may use the debug console hypercall.
        VirtualConsolePermitted = 0x4000_0000,
        /// The partition's console output goes through the debug console hypercall.
        VirtualConsoleActive = 0x8000_0000,
    }
}

/// Interrupt controller routing for a partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IrqChip {
    pub address: u64,
    pub id: u32,
    pub pin_base: u32,
    pub pin_bitmap: [u32; 4],
}

impl IrqChip {
    fn read(r: &mut Reader) -> Result<Self> {
        Ok(Self {
            address: r.u64()?,
            id: r.u32()?,
            pin_base: r.u32()?,
            pin_bitmap: [r.u32()?, r.u32()?, r.u32()?, r.u32()?],
        })
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        w.u64(self.address)?;
        w.u32(self.id)?;
        w.u32(self.pin_base)?;
        for p in self.pin_bitmap {
            w.u32(p)?;
        }
        Ok(())
    }
}

/// A bus device assigned to a partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PciDevice {
    pub kind: u8,
    pub iommu: u8,
    pub domain: u16,
    pub bdf: u16,
    pub shmem_regions_start: u32,
    pub shmem_dev_id: u8,
    pub shmem_peers: u8,
    pub shmem_protocol: u16,
}

impl PciDevice {
    fn read(r: &mut Reader) -> Result<Self> {
        let kind = r.u8()?;
        let iommu = r.u8()?;
        let domain = r.u16()?;
        let bdf = r.u16()?;
        let _reserved = r.u16()?;
        Ok(Self {
            kind,
            iommu,
            domain,
            bdf,
            shmem_regions_start: r.u32()?,
            shmem_dev_id: r.u8()?,
            shmem_peers: r.u8()?,
            shmem_protocol: r.u16()?,
        })
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        w.u8(self.kind)?;
        w.u8(self.iommu)?;
        w.u16(self.domain)?;
        w.u16(self.bdf)?;
        w.u16(0)?;
        w.u32(self.shmem_regions_start)?;
        w.u8(self.shmem_dev_id)?;
        w.u8(self.shmem_peers)?;
        w.u16(self.shmem_protocol)
    }
}

/// A remote core the partition wants attached, identified by its remote-core id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteCoreDevice {
    pub id: u32,
    pub name: ArrayString<32>,
    pub compatible: ArrayString<64>,
}

impl RemoteCoreDevice {
    fn read(r: &mut Reader) -> Result<Self> {
        let id = r.u32()?;
        let _reserved = r.u32()?;
        Ok(Self {
            id,
            name: r.string()?,
            compatible: r.string()?,
        })
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        w.u32(self.id)?;
        w.u32(0)?;
        w.string(&self.name, 32)?;
        w.string(&self.compatible, 64)
    }
}

/// Contents to program into a fabric region when the partition starts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FabricDevice {
    pub region_id: u32,
    /// Number of soft remote cores the bitstream instantiates.
    pub rcpu_count: u32,
    pub conf_address: u64,
    pub overlay: ArrayString<32>,
    pub module: ArrayString<32>,
    pub bitstream: ArrayString<32>,
}

impl FabricDevice {
    fn read(r: &mut Reader) -> Result<Self> {
        Ok(Self {
            region_id: r.u32()?,
            rcpu_count: r.u32()?,
            conf_address: r.u64()?,
            overlay: r.string()?,
            module: r.string()?,
            bitstream: r.string()?,
        })
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        w.u32(self.region_id)?;
        w.u32(self.rcpu_count)?;
        w.u64(self.conf_address)?;
        w.string(&self.overlay, 32)?;
        w.string(&self.module, 32)?;
        w.string(&self.bitstream, 32)
    }
}

/// Counts and sizes from a descriptor header, used to size and walk the variable part.
struct HeaderCounts {
    cpu_set_size: u32,
    rcpu_set_size: u32,
    fabric_set_size: u32,
    num_memory_regions: u32,
    num_irqchips: u32,
    num_pci_devices: u32,
    num_rcpu_devices: u32,
    num_fabric_devices: u32,
}

impl HeaderCounts {
    fn encoded_len(&self) -> u64 {
        CELL_DESC_HEADER_SIZE as u64
            + self.cpu_set_size as u64
            + self.rcpu_set_size as u64
            + self.fabric_set_size as u64
            + self.num_memory_regions as u64 * MEMORY_REGION_SIZE as u64
            + self.num_irqchips as u64 * IRQCHIP_SIZE as u64
            + self.num_pci_devices as u64 * PCI_DEVICE_SIZE as u64
            + self.num_rcpu_devices as u64 * RCPU_DEVICE_SIZE as u64
            + self.num_fabric_devices as u64 * FABRIC_DEVICE_SIZE as u64
    }

    fn check_limits(&self) -> Result<()> {
        check_bitmap::<Cpu>(self.cpu_set_size)?;
        check_bitmap::<RemoteCore>(self.rcpu_set_size)?;
        check_bitmap::<FabricRegion>(self.fabric_set_size)?;
        check_count("memory region", self.num_memory_regions, MAX_MEM_REGIONS)?;
        check_count("irqchip", self.num_irqchips, MAX_IRQCHIPS)?;
        check_count("pci device", self.num_pci_devices, MAX_PCI_DEVICES)?;
        check_count("rcpu device", self.num_rcpu_devices, MAX_RCPU_DEVICES)?;
        check_count("fabric device", self.num_fabric_devices, MAX_FABRIC_DEVICES)
    }
}

fn check_bitmap<C: ResourceClass>(size: u32) -> Result<()> {
    if size as usize > MAX_BITMAP_BYTES {
        return Err(Error::BitmapTooLarge {
            class: C::NAME,
            size,
        });
    }
    Ok(())
}

fn check_count(kind: &'static str, count: u32, max: usize) -> Result<()> {
    if count as usize > max {
        return Err(Error::TooManyEntries { kind, count });
    }
    Ok(())
}

fn read_bitmap(r: &mut Reader, size: u32) -> Result<ArrayVec<u8, MAX_BITMAP_BYTES>> {
    let mut out = ArrayVec::new();
    // Sizes were checked against MAX_BITMAP_BYTES before reading.
    out.try_extend_from_slice(r.take(size as usize)?)
        .map_err(|_| Error::BitmapTooLarge {
            class: "bitmap",
            size,
        })?;
    Ok(out)
}

fn bitmap_from_slice(bytes: &[u8]) -> Result<ArrayVec<u8, MAX_BITMAP_BYTES>> {
    let mut out = ArrayVec::new();
    out.try_extend_from_slice(bytes)
        .map_err(|_| Error::BitmapTooLarge {
            class: "bitmap",
            size: bytes.len() as u32,
        })?;
    Ok(out)
}

fn parse_name(raw: &[u8; CELL_NAME_FIELD_SIZE]) -> Result<ArrayString<CELL_NAME_MAX>> {
    let len = raw.iter().position(|b| *b == 0).ok_or(Error::BadName)?;
    let name = core::str::from_utf8(&raw[..len]).map_err(|_| Error::BadName)?;
    if name.is_empty() {
        return Err(Error::BadName);
    }
    ArrayString::from(name).map_err(|_| Error::BadName)
}

fn set_from_bitmap<C: ResourceClass>(bitmap: &[u8]) -> ResourceSet<C> {
    // Bitmaps never exceed MAX_BITMAP_BYTES, so this can't fail.
    ResourceSet::from_bitmap(bitmap).unwrap_or_else(|| ResourceSet::new(0))
}

/// The static description of a partition.
///
/// Decoded from, and encoded to, the packed little-endian descriptor layout. Decoding validates
/// the header (signature, revision, architecture, name, sizes) before any of the variable-length
/// arrays are touched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellDesc {
    name: ArrayString<CELL_NAME_MAX>,
    architecture: Architecture,
    id: u32,
    flags: FlagSet<CellFlag>,
    cpu_set: ArrayVec<u8, MAX_BITMAP_BYTES>,
    rcpu_set: ArrayVec<u8, MAX_BITMAP_BYTES>,
    fabric_set: ArrayVec<u8, MAX_BITMAP_BYTES>,
    memory_regions: ArrayVec<MemoryRegion, MAX_MEM_REGIONS>,
    irqchips: ArrayVec<IrqChip, MAX_IRQCHIPS>,
    pci_devices: ArrayVec<PciDevice, MAX_PCI_DEVICES>,
    rcpu_devices: ArrayVec<RemoteCoreDevice, MAX_RCPU_DEVICES>,
    fabric_devices: ArrayVec<FabricDevice, MAX_FABRIC_DEVICES>,
    cpu_reset_address: u64,
    msg_reply_timeout: u64,
    console: ConsoleDesc,
}

impl CellDesc {
    /// Creates an empty descriptor named `name`.
    pub fn new(name: &str, id: u32, architecture: Architecture) -> Result<Self> {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(Error::BadName);
        }
        Ok(Self {
            name: ArrayString::from(name).map_err(|_| Error::BadName)?,
            architecture,
            id,
            flags: FlagSet::default(),
            cpu_set: ArrayVec::new(),
            rcpu_set: ArrayVec::new(),
            fabric_set: ArrayVec::new(),
            memory_regions: ArrayVec::new(),
            irqchips: ArrayVec::new(),
            pci_devices: ArrayVec::new(),
            rcpu_devices: ArrayVec::new(),
            fabric_devices: ArrayVec::new(),
            cpu_reset_address: 0,
            msg_reply_timeout: 0,
            console: ConsoleDesc::default(),
        })
    }

    /// Returns the total encoded size announced by a descriptor header, validating the header
    /// along the way. `header` needs to hold at least `CELL_DESC_HEADER_SIZE` bytes.
    pub fn encoded_len_from_header(header: &[u8]) -> Result<u64> {
        let mut r = Reader::new(header);
        Self::read_fixed(&mut r).map(|(_, counts)| counts.encoded_len())
    }

    // Reads and validates the fixed header. Returns a descriptor with empty arrays plus the
    // counts describing them.
    fn read_fixed(r: &mut Reader) -> Result<(Self, HeaderCounts)> {
        let mut h = Reader::new(r.take(CELL_DESC_HEADER_SIZE)?);
        if h.array::<5>()? != CELL_DESC_SIGNATURE {
            return Err(Error::BadSignature);
        }
        let arch = h.u8()?;
        let revision = h.u16()?;
        if revision != CONFIG_REVISION {
            return Err(Error::UnsupportedRevision(revision));
        }
        let architecture = Architecture::from_raw(arch)?;
        let name = parse_name(&h.array::<CELL_NAME_FIELD_SIZE>()?)?;
        let id = h.u32()?;
        let flags = FlagSet::new(h.u32()?).map_err(|_| Error::UnknownFlags)?;
        let counts = HeaderCounts {
            cpu_set_size: h.u32()?,
            rcpu_set_size: h.u32()?,
            fabric_set_size: h.u32()?,
            num_memory_regions: h.u32()?,
            num_irqchips: h.u32()?,
            num_pci_devices: h.u32()?,
            num_rcpu_devices: h.u32()?,
            num_fabric_devices: h.u32()?,
        };
        let cpu_reset_address = h.u64()?;
        let msg_reply_timeout = h.u64()?;
        let console = h.console()?;

        let size = counts.encoded_len();
        if size > MAX_CONFIG_SIZE {
            return Err(Error::TooLarge { size });
        }
        counts.check_limits()?;

        let mut desc = Self::new(&name, id, architecture)?;
        desc.flags = flags;
        desc.cpu_reset_address = cpu_reset_address;
        desc.msg_reply_timeout = msg_reply_timeout;
        desc.console = console;
        Ok((desc, counts))
    }

    /// Decodes a descriptor from `bytes`. Trailing bytes past the encoded length are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let (mut desc, counts) = Self::read_fixed(&mut r)?;
        let size = counts.encoded_len() as usize;
        if bytes.len() < size {
            return Err(Error::Truncated {
                needed: size,
                available: bytes.len(),
            });
        }
        desc.read_arrays(&mut r, &counts)?;
        Ok(desc)
    }

    pub(crate) fn parse_from(r: &mut Reader) -> Result<Self> {
        let (mut desc, counts) = Self::read_fixed(r)?;
        desc.read_arrays(r, &counts)?;
        Ok(desc)
    }

    fn read_arrays(&mut self, r: &mut Reader, counts: &HeaderCounts) -> Result<()> {
        self.cpu_set = read_bitmap(r, counts.cpu_set_size)?;
        self.rcpu_set = read_bitmap(r, counts.rcpu_set_size)?;
        self.fabric_set = read_bitmap(r, counts.fabric_set_size)?;
        for i in 0..counts.num_memory_regions as usize {
            let region = MemoryRegion::read(r, i)?;
            self.memory_regions.push(region);
        }
        for _ in 0..counts.num_irqchips {
            let chip = IrqChip::read(r)?;
            self.irqchips.push(chip);
        }
        for _ in 0..counts.num_pci_devices {
            let dev = PciDevice::read(r)?;
            self.pci_devices.push(dev);
        }
        for _ in 0..counts.num_rcpu_devices {
            let dev = RemoteCoreDevice::read(r)?;
            self.rcpu_devices.push(dev);
        }
        for _ in 0..counts.num_fabric_devices {
            let dev = FabricDevice::read(r)?;
            self.fabric_devices.push(dev);
        }
        Ok(())
    }

    fn counts(&self) -> HeaderCounts {
        HeaderCounts {
            cpu_set_size: self.cpu_set.len() as u32,
            rcpu_set_size: self.rcpu_set.len() as u32,
            fabric_set_size: self.fabric_set.len() as u32,
            num_memory_regions: self.memory_regions.len() as u32,
            num_irqchips: self.irqchips.len() as u32,
            num_pci_devices: self.pci_devices.len() as u32,
            num_rcpu_devices: self.rcpu_devices.len() as u32,
            num_fabric_devices: self.fabric_devices.len() as u32,
        }
    }

    /// Returns the size of the encoded descriptor.
    pub fn encoded_len(&self) -> usize {
        self.counts().encoded_len() as usize
    }

    /// Encodes the descriptor into `buf`, returning the number of bytes written.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        self.write(&mut w)?;
        Ok(w.position())
    }

    pub(crate) fn write(&self, w: &mut Writer) -> Result<()> {
        let counts = self.counts();
        w.bytes(&CELL_DESC_SIGNATURE)?;
        w.u8(self.architecture as u8)?;
        w.u16(CONFIG_REVISION)?;
        w.string(&self.name, CELL_NAME_FIELD_SIZE)?;
        w.u32(self.id)?;
        w.u32(self.flags.bits())?;
        w.u32(counts.cpu_set_size)?;
        w.u32(counts.rcpu_set_size)?;
        w.u32(counts.fabric_set_size)?;
        w.u32(counts.num_memory_regions)?;
        w.u32(counts.num_irqchips)?;
        w.u32(counts.num_pci_devices)?;
        w.u32(counts.num_rcpu_devices)?;
        w.u32(counts.num_fabric_devices)?;
        w.u64(self.cpu_reset_address)?;
        w.u64(self.msg_reply_timeout)?;
        w.console(&self.console)?;
        w.bytes(&self.cpu_set)?;
        w.bytes(&self.rcpu_set)?;
        w.bytes(&self.fabric_set)?;
        for m in self.memory_regions.iter() {
            m.write(w)?;
        }
        for c in self.irqchips.iter() {
            c.write(w)?;
        }
        for d in self.pci_devices.iter() {
            d.write(w)?;
        }
        for d in self.rcpu_devices.iter() {
            d.write(w)?;
        }
        for d in self.fabric_devices.iter() {
            d.write(w)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn flags(&self) -> FlagSet<CellFlag> {
        self.flags
    }

    /// Returns true if the partition never answers messages.
    pub fn has_passive_comm_region(&self) -> bool {
        self.flags.contains(CellFlag::PassiveCommRegion)
    }

    /// Returns the requested CPUs.
    pub fn cpu_set(&self) -> ResourceSet<Cpu> {
        set_from_bitmap(&self.cpu_set)
    }

    /// Returns the requested remote cores.
    pub fn rcpu_set(&self) -> ResourceSet<RemoteCore> {
        set_from_bitmap(&self.rcpu_set)
    }

    /// Returns the requested fabric regions.
    pub fn fabric_set(&self) -> ResourceSet<FabricRegion> {
        set_from_bitmap(&self.fabric_set)
    }

    pub fn memory_regions(&self) -> &[MemoryRegion] {
        &self.memory_regions
    }

    pub fn irqchips(&self) -> &[IrqChip] {
        &self.irqchips
    }

    pub fn pci_devices(&self) -> &[PciDevice] {
        &self.pci_devices
    }

    pub fn rcpu_devices(&self) -> &[RemoteCoreDevice] {
        &self.rcpu_devices
    }

    pub fn fabric_devices(&self) -> &[FabricDevice] {
        &self.fabric_devices
    }

    pub fn cpu_reset_address(&self) -> u64 {
        self.cpu_reset_address
    }

    /// Returns the number of polls to wait for a message reply; 0 waits forever.
    pub fn msg_reply_timeout(&self) -> u64 {
        self.msg_reply_timeout
    }

    pub fn console(&self) -> &ConsoleDesc {
        &self.console
    }

    pub fn set_flags(&mut self, flags: impl Into<FlagSet<CellFlag>>) {
        self.flags = flags.into();
    }

    pub fn set_cpu_bitmap(&mut self, bitmap: &[u8]) -> Result<()> {
        self.cpu_set = bitmap_from_slice(bitmap)?;
        Ok(())
    }

    pub fn set_rcpu_bitmap(&mut self, bitmap: &[u8]) -> Result<()> {
        self.rcpu_set = bitmap_from_slice(bitmap)?;
        Ok(())
    }

    pub fn set_fabric_bitmap(&mut self, bitmap: &[u8]) -> Result<()> {
        self.fabric_set = bitmap_from_slice(bitmap)?;
        Ok(())
    }

    pub fn add_memory_region(&mut self, region: MemoryRegion) -> Result<()> {
        let index = self.memory_regions.len();
        region.validate(index)?;
        self.memory_regions
            .try_push(region)
            .map_err(|_| Error::TooManyEntries {
                kind: "memory region",
                count: index as u32 + 1,
            })
    }

    pub fn add_irqchip(&mut self, chip: IrqChip) -> Result<()> {
        let count = self.irqchips.len() as u32 + 1;
        self.irqchips
            .try_push(chip)
            .map_err(|_| Error::TooManyEntries {
                kind: "irqchip",
                count,
            })
    }

    pub fn add_pci_device(&mut self, dev: PciDevice) -> Result<()> {
        let count = self.pci_devices.len() as u32 + 1;
        self.pci_devices
            .try_push(dev)
            .map_err(|_| Error::TooManyEntries {
                kind: "pci device",
                count,
            })
    }

    pub fn add_rcpu_device(&mut self, dev: RemoteCoreDevice) -> Result<()> {
        let count = self.rcpu_devices.len() as u32 + 1;
        self.rcpu_devices
            .try_push(dev)
            .map_err(|_| Error::TooManyEntries {
                kind: "rcpu device",
                count,
            })
    }

    pub fn add_fabric_device(&mut self, dev: FabricDevice) -> Result<()> {
        let count = self.fabric_devices.len() as u32 + 1;
        self.fabric_devices
            .try_push(dev)
            .map_err(|_| Error::TooManyEntries {
                kind: "fabric device",
                count,
            })
    }

    pub fn set_cpu_reset_address(&mut self, addr: u64) {
        self.cpu_reset_address = addr;
    }

    pub fn set_msg_reply_timeout(&mut self, polls: u64) {
        self.msg_reply_timeout = polls;
    }

    pub fn set_console(&mut self, console: ConsoleDesc) {
        self.console = console;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemFlag;
    use std::vec::Vec;

    fn sample_desc() -> CellDesc {
        let mut desc = CellDesc::new("inmate-demo", 1, Architecture::Arm64).unwrap();
        desc.set_flags(CellFlag::PassiveCommRegion | CellFlag::VirtualConsolePermitted);
        desc.set_cpu_bitmap(&[0x0c]).unwrap();
        desc.set_rcpu_bitmap(&[0x04]).unwrap();
        desc.set_fabric_bitmap(&[0x01]).unwrap();
        desc.add_memory_region(MemoryRegion::new(
            0x7000_0000,
            0,
            0x200_0000,
            MemFlag::Read | MemFlag::Write | MemFlag::Execute | MemFlag::Loadable,
        ))
        .unwrap();
        desc.add_memory_region(MemoryRegion::new(
            0,
            0x8000_0000,
            0x1000,
            MemFlag::Read | MemFlag::Write | MemFlag::CommRegion,
        ))
        .unwrap();
        desc.add_irqchip(IrqChip {
            address: 0xf901_0000,
            id: 0,
            pin_base: 32,
            pin_bitmap: [1, 0, 0, 1 << 16],
        })
        .unwrap();
        desc.add_rcpu_device(RemoteCoreDevice {
            id: 2,
            name: ArrayString::from("pico32").unwrap(),
            compatible: ArrayString::from("pico32-remoteproc").unwrap(),
        })
        .unwrap();
        desc.add_fabric_device(FabricDevice {
            region_id: 0,
            rcpu_count: 1,
            conf_address: 0x8000_0000,
            overlay: ArrayString::from("pico32.dtbo").unwrap(),
            module: ArrayString::from("pico32_remoteproc").unwrap(),
            bitstream: ArrayString::from("pico32.bit").unwrap(),
        })
        .unwrap();
        desc.set_cpu_reset_address(0x7000_0000);
        desc.set_msg_reply_timeout(100);
        desc.set_console(ConsoleDesc {
            address: 0xff01_0000,
            size: 0x1000,
            kind: 4,
            flags: 0x12,
            ..Default::default()
        });
        desc
    }

    fn encode(desc: &CellDesc) -> Vec<u8> {
        let mut buf = vec![0u8; desc.encoded_len()];
        assert_eq!(desc.write_to(&mut buf), Ok(buf.len()));
        buf
    }

    #[test]
    fn encode_decode() {
        let desc = sample_desc();
        let bytes = encode(&desc);
        assert_eq!(
            bytes.len(),
            CELL_DESC_HEADER_SIZE + 3 + 2 * MEMORY_REGION_SIZE + 32 + 104 + 112
        );
        assert_eq!(&bytes[0..5], b"CVCEL");
        assert_eq!(
            CellDesc::encoded_len_from_header(&bytes[..CELL_DESC_HEADER_SIZE]),
            Ok(bytes.len() as u64)
        );
        let parsed = CellDesc::parse(&bytes).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(parsed.cpu_set().iter().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(parsed.rcpu_set().iter().collect::<Vec<_>>(), vec![2]);
        assert!(parsed.has_passive_comm_region());
    }

    #[test]
    fn header_validation() {
        let bytes = encode(&sample_desc());

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert_eq!(CellDesc::parse(&bad), Err(Error::BadSignature));

        let mut bad = bytes.clone();
        bad[6..8].copy_from_slice(&(CONFIG_REVISION + 1).to_le_bytes());
        assert_eq!(
            CellDesc::parse(&bad),
            Err(Error::UnsupportedRevision(CONFIG_REVISION + 1))
        );

        let mut bad = bytes.clone();
        bad[5] = 9;
        assert_eq!(CellDesc::parse(&bad), Err(Error::UnknownArchitecture(9)));

        // Name without a terminator.
        let mut bad = bytes.clone();
        bad[8..40].fill(b'a');
        assert_eq!(CellDesc::parse(&bad), Err(Error::BadName));

        let mut bad = bytes.clone();
        bad[8..40].fill(0);
        assert_eq!(CellDesc::parse(&bad), Err(Error::BadName));

        assert_eq!(
            CellDesc::parse(&bytes[..bytes.len() - 1]),
            Err(Error::Truncated {
                needed: bytes.len(),
                available: bytes.len() - 1
            })
        );
        assert!(matches!(
            CellDesc::parse(&bytes[..10]),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn size_limits() {
        let bytes = encode(&sample_desc());

        // An absurd region count is rejected from the header alone.
        let mut bad = bytes.clone();
        bad[60..64].copy_from_slice(&100_000u32.to_le_bytes());
        assert!(matches!(
            CellDesc::encoded_len_from_header(&bad[..CELL_DESC_HEADER_SIZE]),
            Err(Error::TooLarge { .. })
        ));
        assert_eq!(
            cell_abi::Error::from(CellDesc::parse(&bad).unwrap_err()),
            cell_abi::Error::ConfigTooLarge
        );

        let mut bad = bytes.clone();
        bad[60..64].copy_from_slice(&(MAX_MEM_REGIONS as u32 + 1).to_le_bytes());
        assert!(matches!(
            CellDesc::parse(&bad),
            Err(Error::TooManyEntries { .. })
        ));

        let mut bad = bytes;
        bad[48..52].copy_from_slice(&33u32.to_le_bytes());
        assert_eq!(
            CellDesc::parse(&bad),
            Err(Error::BitmapTooLarge {
                class: "cpu",
                size: 33
            })
        );
    }

    #[test]
    fn builder_checks() {
        assert_eq!(
            CellDesc::new("", 1, Architecture::Arm64),
            Err(Error::BadName)
        );
        let long = "x".repeat(CELL_NAME_MAX + 1);
        assert_eq!(
            CellDesc::new(&long, 1, Architecture::Arm64),
            Err(Error::BadName)
        );
        let mut desc = CellDesc::new("a", 1, Architecture::Arm64).unwrap();
        assert!(desc.set_cpu_bitmap(&[0u8; 33]).is_err());
        assert_eq!(
            desc.add_memory_region(MemoryRegion::new(0, 0, 0, MemFlag::Read)),
            Err(Error::BadMemoryRegion { index: 0 })
        );
    }
}
