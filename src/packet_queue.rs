/// A slot of the packet slab.
///
/// `start` and `len` describe the unconsumed window of `buffer`; partial
/// reads advance `start` instead of shifting the payload. `next` links the
/// slot into either the arrival queue or the free list.
struct Slot<const BUFFER_SIZE: usize> {
    buffer: [u8; BUFFER_SIZE],
    link_id: usize,
    start: usize,
    len: usize,
    next: Option<usize>,
}
impl<const BUFFER_SIZE: usize> Slot<BUFFER_SIZE> {
    const EMPTY: Self = Self {
        buffer: [0u8; BUFFER_SIZE],
        link_id: 0,
        start: 0,
        len: 0,
        next: None,
    };
}

/// An ordered, multi-tenant queue of received-but-unconsumed payloads.
///
/// Backed by `BUFFER_COUNT` statically sized buffers, linked by slot index
/// rather than pointers. Appending, releasing and unlinking the first match
/// for a link id are all O(1) apart from the head scan; packets for the same
/// link id come back out in strict arrival order, packets for different ids
/// interleave arbitrarily.
pub(crate) struct PacketQueue<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> {
    slots: [Slot<BUFFER_SIZE>; BUFFER_COUNT],
    head: Option<usize>,
    tail: Option<usize>,
    free: Option<usize>,
}
impl<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> PacketQueue<BUFFER_SIZE, BUFFER_COUNT> {
    pub fn new() -> Self {
        let mut slots = [Slot::EMPTY; BUFFER_COUNT];
        for i in 1..BUFFER_COUNT {
            slots[i - 1].next = Some(i);
        }
        Self {
            slots,
            head: None,
            tail: None,
            free: if BUFFER_COUNT == 0 { None } else { Some(0) },
        }
    }
    /// Take a slot off the free list.
    ///
    /// The slot is not part of the queue until [Self::commit] links it in.
    pub fn alloc(&mut self) -> Option<usize> {
        let index = self.free?;
        self.free = self.slots[index].next;
        self.slots[index].next = None;
        Some(index)
    }
    /// The payload buffer of an allocated slot.
    pub fn buffer_mut(&mut self, index: usize) -> &mut [u8; BUFFER_SIZE] {
        &mut self.slots[index].buffer
    }
    /// Return an allocated slot to the free list without queueing it.
    pub fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.start = 0;
        slot.len = 0;
        slot.next = self.free;
        self.free = Some(index);
    }
    /// Append an allocated slot to the queue tail.
    pub fn commit(&mut self, index: usize, link_id: usize, len: usize) {
        let slot = &mut self.slots[index];
        slot.link_id = link_id;
        slot.start = 0;
        slot.len = len;
        slot.next = None;
        match self.tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        trace!("Queued packet for link {}, {} bytes.", link_id, len);
    }
    /// Copy out of the first queued packet for `link_id`.
    ///
    /// A packet that fits `dst` entirely is unlinked and freed, adjusting the
    /// tail when it was the last node. A larger packet has `dst.len()` bytes
    /// copied and its window advanced, so a later call continues where this
    /// one stopped. `None` means no packet for that id is queued.
    pub fn pop_front(&mut self, link_id: usize, dst: &mut [u8]) -> Option<usize> {
        let mut prev = None;
        let mut cur = self.head;
        while let Some(index) = cur {
            if self.slots[index].link_id != link_id {
                prev = cur;
                cur = self.slots[index].next;
                continue;
            }
            let slot = &mut self.slots[index];
            if slot.len <= dst.len() {
                let len = slot.len;
                dst[..len].copy_from_slice(&slot.buffer[slot.start..slot.start + len]);
                let next = slot.next;
                match prev {
                    Some(p) => self.slots[p].next = next,
                    None => self.head = next,
                }
                if next.is_none() {
                    self.tail = prev;
                }
                self.release(index);
                return Some(len);
            } else {
                let amount = dst.len();
                dst.copy_from_slice(&slot.buffer[slot.start..slot.start + amount]);
                slot.start += amount;
                slot.len -= amount;
                return Some(amount);
            }
        }
        None
    }
    /// Drop every queued packet for `link_id`.
    pub fn purge(&mut self, link_id: usize) {
        let mut prev: Option<usize> = None;
        let mut cur = self.head;
        while let Some(index) = cur {
            let next = self.slots[index].next;
            if self.slots[index].link_id == link_id {
                match prev {
                    Some(p) => self.slots[p].next = next,
                    None => self.head = next,
                }
                if next.is_none() {
                    self.tail = prev;
                }
                self.release(index);
            } else {
                prev = cur;
            }
            cur = next;
        }
    }
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push<const BS: usize, const BC: usize>(
        queue: &mut PacketQueue<BS, BC>,
        link_id: usize,
        data: &[u8],
    ) -> bool {
        let Some(slot) = queue.alloc() else {
            return false;
        };
        queue.buffer_mut(slot)[..data.len()].copy_from_slice(data);
        queue.commit(slot, link_id, data.len());
        true
    }

    #[test]
    fn per_id_fifo_with_interleaved_ids() {
        let mut queue = PacketQueue::<16, 4>::new();
        assert!(push(&mut queue, 0, b"aaa"));
        assert!(push(&mut queue, 1, b"xx"));
        assert!(push(&mut queue, 0, b"bbb"));

        let mut buf = [0u8; 16];
        assert_eq!(queue.pop_front(0, &mut buf), Some(3));
        assert_eq!(&buf[..3], b"aaa");
        assert_eq!(queue.pop_front(0, &mut buf), Some(3));
        assert_eq!(&buf[..3], b"bbb");
        assert_eq!(queue.pop_front(1, &mut buf), Some(2));
        assert_eq!(&buf[..2], b"xx");
        assert!(queue.is_empty());
    }

    #[test]
    fn partial_reads_continue_where_they_stopped() {
        let mut queue = PacketQueue::<16, 2>::new();
        assert!(push(&mut queue, 2, b"abcdefgh"));

        let mut buf = [0u8; 3];
        assert_eq!(queue.pop_front(2, &mut buf), Some(3));
        assert_eq!(&buf, b"abc");
        assert_eq!(queue.pop_front(2, &mut buf), Some(3));
        assert_eq!(&buf, b"def");
        // Remainder is smaller than the capacity, so the packet is freed.
        let mut rest = [0u8; 8];
        assert_eq!(queue.pop_front(2, &mut rest), Some(2));
        assert_eq!(&rest[..2], b"gh");
        assert_eq!(queue.pop_front(2, &mut rest), None);
    }

    #[test]
    fn partial_read_keeps_arrival_order() {
        let mut queue = PacketQueue::<16, 4>::new();
        assert!(push(&mut queue, 0, b"1234"));
        assert!(push(&mut queue, 0, b"5678"));

        let mut buf = [0u8; 2];
        assert_eq!(queue.pop_front(0, &mut buf), Some(2));
        assert_eq!(&buf, b"12");
        // The partially consumed packet stays ahead of the second one.
        assert_eq!(queue.pop_front(0, &mut buf), Some(2));
        assert_eq!(&buf, b"34");
        assert_eq!(queue.pop_front(0, &mut buf), Some(2));
        assert_eq!(&buf, b"56");
    }

    #[test]
    fn tail_is_reset_after_last_packet_is_consumed() {
        let mut queue = PacketQueue::<8, 2>::new();
        assert!(push(&mut queue, 0, b"abc"));
        let mut buf = [0u8; 8];
        assert_eq!(queue.pop_front(0, &mut buf), Some(3));
        assert!(queue.is_empty());

        // A following insertion must land at the head, not behind a stale
        // tail reference.
        assert!(push(&mut queue, 3, b"xyz"));
        assert_eq!(queue.pop_front(3, &mut buf), Some(3));
        assert_eq!(&buf[..3], b"xyz");
    }

    #[test]
    fn removing_the_last_of_several_fixes_the_tail() {
        let mut queue = PacketQueue::<8, 3>::new();
        assert!(push(&mut queue, 0, b"aa"));
        assert!(push(&mut queue, 1, b"bb"));

        let mut buf = [0u8; 8];
        // Remove the tail node (id 1), then append again.
        assert_eq!(queue.pop_front(1, &mut buf), Some(2));
        assert!(push(&mut queue, 1, b"cc"));
        assert_eq!(queue.pop_front(0, &mut buf), Some(2));
        assert_eq!(&buf[..2], b"aa");
        assert_eq!(queue.pop_front(1, &mut buf), Some(2));
        assert_eq!(&buf[..2], b"cc");
    }

    #[test]
    fn alloc_exhaustion_and_reuse() {
        let mut queue = PacketQueue::<8, 2>::new();
        assert!(push(&mut queue, 0, b"a"));
        assert!(push(&mut queue, 0, b"b"));
        assert!(queue.alloc().is_none());

        let mut buf = [0u8; 8];
        assert_eq!(queue.pop_front(0, &mut buf), Some(1));
        assert!(push(&mut queue, 0, b"c"));
    }

    #[test]
    fn zero_capacity_read_leaves_the_packet_queued() {
        let mut queue = PacketQueue::<8, 1>::new();
        assert!(push(&mut queue, 0, b"data"));
        let mut empty = [0u8; 0];
        assert_eq!(queue.pop_front(0, &mut empty), Some(0));
        let mut buf = [0u8; 8];
        assert_eq!(queue.pop_front(0, &mut buf), Some(4));
        assert_eq!(&buf[..4], b"data");
    }

    #[test]
    fn purge_drops_only_the_requested_id() {
        let mut queue = PacketQueue::<8, 4>::new();
        assert!(push(&mut queue, 0, b"aa"));
        assert!(push(&mut queue, 1, b"bb"));
        assert!(push(&mut queue, 0, b"cc"));

        queue.purge(0);
        let mut buf = [0u8; 8];
        assert_eq!(queue.pop_front(0, &mut buf), None);
        assert_eq!(queue.pop_front(1, &mut buf), Some(2));
        assert_eq!(&buf[..2], b"bb");
        // Purged slots are reusable.
        assert!(push(&mut queue, 2, b"dd"));
        assert!(push(&mut queue, 2, b"ee"));
        assert!(push(&mut queue, 2, b"ff"));
    }
}
