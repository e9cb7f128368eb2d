//! Virtual-memory integration: demand loading, two-list eviction,
//! swap round trips, memory-mapped files and process teardown.

mod common;

use std::sync::Arc;

use common::MemDisk;
use minos_core::{
    fs::{File, FileSys, Inode},
    param::PAGE_SIZE,
    proc::{self, Thread, Tid},
    vm::{Position, SoftPageDir, UPage, Vm},
    KernelError,
};
use minos_fs_types::{InodeKind, SectorNo};
use sector_cache::Owner;

struct Harness {
    fs: Arc<FileSys>,
    vm: Vm,
    t: Arc<Thread>,
    pd: Arc<SoftPageDir>,
}

fn harness(pool_pages: usize) -> Harness {
    let fs = FileSys::new(MemDisk::new(4096), true).unwrap();
    let vm = Vm::new(pool_pages, MemDisk::new(1024));
    let pd = Arc::new(SoftPageDir::new());
    let t = Thread::new(Tid(1), pd.clone());
    Harness { fs, vm, t, pd }
}

fn make_file(
    fs: &Arc<FileSys>,
    len: usize,
    fill: impl Fn(usize) -> u8,
) -> (SectorNo, Arc<File>) {
    let sector = fs.allocate_sector().unwrap();
    fs.create_inode(sector, 0, InodeKind::File).unwrap();
    let file = File::open(Inode::open(fs, sector).unwrap(), Owner::KERNEL);
    let data: Vec<u8> = (0..len).map(fill).collect();
    assert_eq!(file.write_at(&data, 0), len);
    (sector, file)
}

fn up(base: usize, i: usize) -> UPage {
    UPage::new(base + i * PAGE_SIZE).unwrap()
}

/// Asserts that every supplemental entry is in one of the five legal
/// position states and that swap slots are unique and in use.
fn check_page_invariants(h: &Harness) {
    let legal = [
        Position::STACK,
        Position::FILE,
        Position::MMAPFILE,
        Position::STACK | Position::SWAP,
        Position::FILE | Position::SWAP,
    ];
    let pages = h.t.pages().lock();
    let mut slots = Vec::new();
    for entry in pages.iter() {
        assert!(legal.contains(&entry.position()), "bad position");
        if let Some(slot) = entry.swap_slot() {
            assert!(!h.vm.swap().is_free(slot), "referenced slot marked free");
            assert!(!slots.contains(&slot), "slot referenced twice");
            slots.push(slot);
        }
    }
}

#[test]
fn stack_page_evicts_to_swap_and_faults_back() {
    let h = harness(2);
    let base = 0x1000_0000;

    h.vm.grow_stack(&h.t, up(base, 0)).unwrap();
    h.vm.grow_stack(&h.t, up(base, 1)).unwrap();
    for i in 0..2 {
        let kpage = h.t.pagedir().lookup(up(base, i)).unwrap();
        h.vm.pool().with_page_mut(kpage, |data| data.fill(i as u8 + 1));
    }
    assert_eq!(h.vm.pool().available(), 0);

    // A third page forces an eviction; the first stack page is the
    // coldest and its accessed bit is clear.
    h.vm.grow_stack(&h.t, up(base, 2)).unwrap();
    h.vm.check_frame_consistency();
    check_page_invariants(&h);

    let victim = up(base, 0);
    assert_eq!(h.vm.swap().used_slots(), 1);
    {
        let pages = h.t.pages().lock();
        let entry = pages.find(victim).unwrap();
        assert_eq!(entry.position(), Position::STACK | Position::SWAP);
        assert!(!entry.is_loaded());
        assert!(entry.swap_slot().is_some());
    }
    assert!(h.t.pagedir().lookup(victim).is_none());

    // Faulting it back restores the original bytes and demotes the
    // entry to a plain stack page.
    h.vm.load_page(&h.t, victim).unwrap();
    let kpage = h.t.pagedir().lookup(victim).unwrap();
    h.vm.pool()
        .with_page(kpage, |data| assert!(data.iter().all(|&b| b == 1)));
    {
        let pages = h.t.pages().lock();
        let entry = pages.find(victim).unwrap();
        assert_eq!(entry.position(), Position::STACK);
        assert!(entry.is_loaded());
    }
    // Loading released the victim's slot; the page evicted to make
    // room took another one.
    assert_eq!(h.vm.swap().used_slots(), 1);
    h.vm.check_frame_consistency();
    check_page_invariants(&h);
}

#[test]
fn file_page_loads_with_zeroed_tail() {
    let h = harness(4);
    let (_, file) = make_file(&h.fs, 300, |i| (i % 251) as u8);
    let upage = UPage::new(0x2000_0000).unwrap();

    h.t.pages()
        .lock()
        .add_file(file, 0, upage, 300, PAGE_SIZE - 300, true)
        .unwrap();
    assert_eq!(
        h.t.pages().lock().find(upage).unwrap().position(),
        Position::FILE
    );

    // Fault anywhere inside the page.
    h.vm.handle_fault(&h.t, upage.addr() + 123).unwrap();

    let kpage = h.t.pagedir().lookup(upage).unwrap();
    h.vm.pool().with_page(kpage, |data| {
        for (i, &b) in data[..300].iter().enumerate() {
            assert_eq!(b, (i % 251) as u8);
        }
        assert!(data[300..].iter().all(|&b| b == 0));
    });
    assert_eq!(h.pd.is_writable(upage), Some(true));
}

#[test]
fn read_only_file_pages_need_no_swap() {
    let h = harness(1);
    let (_, file) = make_file(&h.fs, PAGE_SIZE, |i| i as u8);
    let ro = UPage::new(0x2000_0000).unwrap();
    let rw = UPage::new(0x2010_0000).unwrap();

    h.t.pages()
        .lock()
        .add_file(file.clone(), 0, ro, PAGE_SIZE, 0, false)
        .unwrap();
    h.vm.load_page(&h.t, ro).unwrap();
    assert_eq!(h.pd.is_writable(ro), Some(false));

    // Loading a second page evicts the read-only one without touching
    // swap: the file itself is its backing store.
    h.t.pages()
        .lock()
        .add_file(file, 0, rw, PAGE_SIZE, 0, true)
        .unwrap();
    h.vm.load_page(&h.t, rw).unwrap();
    assert_eq!(h.vm.swap().used_slots(), 0);
    {
        let pages = h.t.pages().lock();
        let entry = pages.find(ro).unwrap();
        assert_eq!(entry.position(), Position::FILE);
        assert!(!entry.is_loaded());
    }

    // Evicting the writable page does use swap.
    h.vm.load_page(&h.t, ro).unwrap();
    assert_eq!(h.vm.swap().used_slots(), 1);
    assert_eq!(
        h.t.pages().lock().find(rw).unwrap().position(),
        Position::FILE | Position::SWAP
    );

    // The re-read page still holds the file bytes.
    let kpage = h.t.pagedir().lookup(ro).unwrap();
    h.vm.pool().with_page(kpage, |data| {
        for (i, &b) in data.iter().enumerate() {
            assert_eq!(b, i as u8);
        }
    });
    check_page_invariants(&h);
}

#[test]
fn mmap_writes_back_only_dirty_pages() {
    let h = harness(8);
    let (sector, _keep) = make_file(&h.fs, 2 * PAGE_SIZE, |i| {
        if i < PAGE_SIZE {
            0x11
        } else {
            0x22
        }
    });

    let fd = h.t.open_file(&h.fs, sector).unwrap();
    let addr = 0x3000_0000;
    let mapid = h.vm.mmap_fd(&h.t, fd, addr).unwrap();
    assert_eq!(mapid.value(), 1);
    assert_eq!(h.t.pages().lock().len(), 2);
    // The mapping holds its own reopened handle.
    h.t.close_fd(fd).unwrap();

    let page0 = UPage::new(addr).unwrap();
    let page1 = page0.add_pages(1);
    h.vm.handle_fault(&h.t, page0.addr()).unwrap();
    h.vm.handle_fault(&h.t, page1.addr()).unwrap();
    assert_eq!(
        h.t.pages().lock().find(page0).unwrap().position(),
        Position::MMAPFILE
    );

    // Dirty page 0 only.
    let kpage = h.t.pagedir().lookup(page0).unwrap();
    h.vm.pool().with_page_mut(kpage, |data| data.fill(0x33));
    h.t.pagedir().set_dirty(page0, true);

    h.vm.munmap(&h.t, mapid).unwrap();
    assert_eq!(h.t.pages().lock().len(), 0);
    assert_eq!(h.vm.pool().available(), 8);
    assert_eq!(h.pd.mapped_count(), 0);

    let file = File::open(Inode::open(&h.fs, sector).unwrap(), Owner::KERNEL);
    let mut out = vec![0u8; 2 * PAGE_SIZE];
    assert_eq!(file.read_at(&mut out, 0), 2 * PAGE_SIZE);
    assert!(out[..PAGE_SIZE].iter().all(|&b| b == 0x33));
    assert!(out[PAGE_SIZE..].iter().all(|&b| b == 0x22));
}

#[test]
fn mmap_one_byte_file_maps_one_page() {
    let h = harness(4);
    let (sector, _keep) = make_file(&h.fs, 1, |_| b'Z');

    let fd = h.t.open_file(&h.fs, sector).unwrap();
    let addr = 0x3000_0000;
    let mapid = h.vm.mmap_fd(&h.t, fd, addr).unwrap();
    assert_eq!(h.t.pages().lock().len(), 1);

    let page = UPage::new(addr).unwrap();
    h.vm.handle_fault(&h.t, addr).unwrap();
    let kpage = h.t.pagedir().lookup(page).unwrap();
    h.vm.pool().with_page(kpage, |data| {
        assert_eq!(data[0], b'Z');
        assert!(data[1..].iter().all(|&b| b == 0));
    });

    // Touch the page; only one byte's worth is written back.
    h.vm.pool().with_page_mut(kpage, |data| {
        data[0] = b'Q';
        data[100] = 0xEE;
    });
    h.t.pagedir().set_dirty(page, true);
    h.vm.munmap(&h.t, mapid).unwrap();

    let file = File::open(Inode::open(&h.fs, sector).unwrap(), Owner::KERNEL);
    assert_eq!(file.len().unwrap(), 1);
    let mut out = [0u8; 1];
    assert_eq!(file.read_at(&mut out, 0), 1);
    assert_eq!(out[0], b'Q');
}

#[test]
fn mmap_rejects_bad_arguments() {
    let h = harness(4);
    let (sector, file) = make_file(&h.fs, PAGE_SIZE, |_| 1);
    let fd = h.t.open_file(&h.fs, sector).unwrap();

    // Console descriptors.
    assert_eq!(
        h.vm.mmap_fd(&h.t, 0, 0x3000_0000),
        Err(KernelError::BadFileDescriptor(0))
    );
    assert_eq!(
        h.vm.mmap_fd(&h.t, 1, 0x3000_0000),
        Err(KernelError::BadFileDescriptor(1))
    );
    // Unaligned and null addresses.
    assert_eq!(
        h.vm.mmap_fd(&h.t, fd, 0x3000_0123),
        Err(KernelError::BadMappingAddress(0x3000_0123))
    );
    assert_eq!(
        h.vm.mmap_fd(&h.t, fd, 0),
        Err(KernelError::BadMappingAddress(0))
    );
    // Empty files.
    let (empty_sector, _) = make_file(&h.fs, 0, |_| 0);
    let empty_fd = h.t.open_file(&h.fs, empty_sector).unwrap();
    assert_eq!(
        h.vm.mmap_fd(&h.t, empty_fd, 0x3000_0000),
        Err(KernelError::EmptyMapping)
    );

    // Overlap with an existing mapping.
    let first = h.vm.mmap(&h.t, &file, 0x3000_0000).unwrap();
    assert_eq!(first.value(), 1);
    assert_eq!(
        h.vm.mmap(&h.t, &file, 0x3000_0000),
        Err(KernelError::MappingOverlap)
    );
    assert_eq!(h.t.pages().lock().len(), 1);

    // Mapids are monotonic within the process.
    let second = h.vm.mmap(&h.t, &file, 0x4000_0000).unwrap();
    assert_eq!(second.value(), 2);

    // Unknown mapid.
    h.vm.munmap(&h.t, second).unwrap();
    assert_eq!(
        h.vm.munmap(&h.t, second),
        Err(KernelError::MappingNotFound(2))
    );
}

#[test]
fn fault_on_unmapped_address_is_an_error() {
    let h = harness(2);
    assert!(matches!(
        h.vm.handle_fault(&h.t, 0x7777_7123),
        Err(KernelError::PageNotPresent(0x7777_7123))
    ));
}

#[test]
fn swap_slots_are_single_use() {
    let h = harness(2);
    let kpage = h.vm.pool().alloc().unwrap();
    h.vm.pool().with_page_mut(kpage, |data| {
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 13) as u8;
        }
    });

    let slot = h.vm.swap().store(h.vm.pool(), kpage).unwrap();
    assert!(!h.vm.swap().is_free(slot));

    let other = h.vm.pool().alloc().unwrap();
    h.vm.swap().load(h.vm.pool(), other, slot);
    assert!(h.vm.swap().is_free(slot));
    h.vm.pool().with_page(other, |data| {
        for (i, &b) in data.iter().enumerate() {
            assert_eq!(b, (i % 13) as u8);
        }
    });
}

#[test]
fn multi_page_frames_allocate_and_free_together() {
    let h = harness(4);
    let kpage = h.vm.frame_get_multiple(&h.t, 2).unwrap();
    let info = h.vm.frame_find(kpage).unwrap();
    assert_eq!(info.size, 2);
    assert!(info.active);
    assert_eq!(h.vm.pool().available(), 2);

    // Multi-page requests do not fall back to eviction.
    assert_eq!(
        h.vm.frame_get_multiple(&h.t, 3),
        Err(KernelError::NoFreePage)
    );

    h.vm.frame_free(kpage);
    assert_eq!(h.vm.pool().available(), 4);
    assert_eq!(h.vm.frame_len(), 0);
}

#[test]
fn exit_reclaims_frames_swap_mappings_and_descriptors() {
    let h = harness(3);
    let base = 0x1000_0000;

    // One stack page that will be evicted to swap, one live, one
    // dirty mapped page.
    h.vm.grow_stack(&h.t, up(base, 0)).unwrap();
    let k0 = h.t.pagedir().lookup(up(base, 0)).unwrap();
    h.vm.pool().with_page_mut(k0, |data| data.fill(0xAB));

    let (sector, _keep) = make_file(&h.fs, PAGE_SIZE, |_| 0x44);
    let fd = h.t.open_file(&h.fs, sector).unwrap();
    let mapid = h.vm.mmap_fd(&h.t, fd, 0x3000_0000).unwrap();
    let mpage = UPage::new(0x3000_0000).unwrap();
    h.vm.handle_fault(&h.t, mpage.addr()).unwrap();
    let km = h.t.pagedir().lookup(mpage).unwrap();
    h.vm.pool().with_page_mut(km, |data| data.fill(0x77));
    h.t.pagedir().set_dirty(mpage, true);
    let _ = mapid;

    h.vm.grow_stack(&h.t, up(base, 1)).unwrap();
    // Pool is full; the next page evicts the cold stack page to swap.
    h.vm.grow_stack(&h.t, up(base, 2)).unwrap();
    assert_eq!(h.vm.swap().used_slots(), 1);
    check_page_invariants(&h);

    proc::exit(&h.t, &h.vm, &h.fs);

    assert_eq!(h.vm.pool().available(), 3);
    assert_eq!(h.vm.frame_len(), 0);
    assert_eq!(h.vm.frame_counts(), (0, 0));
    assert_eq!(h.vm.swap().used_slots(), 0);
    assert!(h.t.pages().lock().is_empty());
    assert!(h.t.mmaps().lock().is_empty());
    assert_eq!(h.t.files().lock().open_count(), 0);
    assert_eq!(h.pd.mapped_count(), 0);

    // The dirty mapped page reached the file during teardown.
    let file = File::open(Inode::open(&h.fs, sector).unwrap(), Owner::KERNEL);
    let mut out = vec![0u8; PAGE_SIZE];
    assert_eq!(file.read_at(&mut out, 0), PAGE_SIZE);
    assert!(out.iter().all(|&b| b == 0x77));
}
