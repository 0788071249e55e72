//! A small library for ~~hating on~~ evaluating the correctness of block
//! allocators that hand out physical address ranges.
//!
//! The memory behind a physical address cannot be touched from a test, so
//! instead of painting allocations this keeps a shadow list of every range
//! handed out and checks each new one against it.

use std::ops::Range;

/// An allocation size in bytes, kept small enough that most requests can be
/// served.
#[derive(Clone, Copy, Debug)]
pub struct ArbSize(pub u32);

impl ArbSize {
    /// Limit on allocation size, expressed in bits.
    pub const LIMIT_BITS: u8 = 20;
}

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit count so small sizes are as likely as large ones.
        let exp = u8::arbitrary(u)? % (ArbSize::LIMIT_BITS + 1);
        let size = u32::arbitrary(u)? % 2_u32.pow(exp.into());

        Ok(ArbSize(size))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    Alloc(u32),
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type Op: for<'a> arbitrary::Arbitrary<'a>;
    type AllocError;
    type DeallocError;

    /// The granularity of allocations in bytes. Every request is rounded up
    /// to a multiple of it.
    fn granularity(&self) -> u32;

    /// Allocates `bytes` bytes, returning the start address.
    fn allocate(&mut self, bytes: u32) -> Result<u64, Self::AllocError>;

    /// Deallocates the `bytes` bytes at `addr`.
    ///
    /// `addr` and `bytes` are those of a block currently allocated by this
    /// subject.
    fn deallocate(&mut self, addr: u64, bytes: u32) -> Result<(), Self::DeallocError>;

    /// Returns `false` if the subject's internal bookkeeping is inconsistent.
    fn is_consistent(&self) -> bool {
        true
    }

    fn handle_custom_op(&mut self, op: Self::Op) {
        // To silence the unused variable warning.
        drop(op);
    }
}

/// A list of allocated blocks.
#[derive(Debug, Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }

    /// Returns the first outstanding block that shares an address with
    /// `block`.
    pub fn overlapping(&self, block: &Block) -> Option<&Block> {
        self.blocks.iter().find(|b| b.overlaps(block))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated range of addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    // The start address.
    addr: u64,
    // The size originally requested.
    bytes: u32,
    // The rounded-up extent of the allocation.
    extent: u64,
    // The unique ID of the operation that allocated this block.
    id: u64,
}

impl Block {
    /// Creates a block for a request of `bytes` bytes served at `addr`.
    pub fn new(addr: u64, bytes: u32, granularity: u32, id: u64) -> Block {
        let extent = u64::from(bytes.div_ceil(granularity)) * u64::from(granularity);
        Block {
            addr,
            bytes,
            extent,
            id,
        }
    }

    /// Returns the addresses covered by the block.
    pub fn range(&self) -> Range<u64> {
        self.addr..self.addr + self.extent
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn bytes(&self) -> u32 {
        self.bytes
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` if `self` and `other` share at least one address.
    pub fn overlaps(&self, other: &Block) -> bool {
        let (a, b) = (self.range(), other.range());
        a.start < b.end && b.start < a.end
    }
}

/// Why an evaluation stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// The subject handed out a range that overlaps an outstanding block.
    Overlap { new: Block, existing: Block },
    /// The subject refused to deallocate an outstanding block.
    DeallocRejected(Block),
    /// The subject's bookkeeping became inconsistent.
    Inconsistent,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: AllocatorOp,
    pub failure: Failure,
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();
        let granularity = self.subject.granularity();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            let failure = match op {
                AllocatorOp::Alloc(bytes) => match self.subject.allocate(bytes) {
                    Ok(addr) => {
                        let block = Block::new(addr, bytes, granularity, op_id);
                        match blocks.overlapping(&block) {
                            Some(existing) => Some(Failure::Overlap {
                                new: block,
                                existing: existing.clone(),
                            }),
                            None => {
                                blocks.push(block);
                                None
                            }
                        }
                    }

                    Err(_) => None,
                },

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(block) => self
                        .subject
                        .deallocate(block.addr, block.bytes)
                        .err()
                        .map(|_| Failure::DeallocRejected(block)),
                    None => None,
                },
            };

            let failure = failure.or_else(|| {
                (!self.subject.is_consistent()).then_some(Failure::Inconsistent)
            });

            if let Some(failure) = failure {
                return Err(Failed {
                    completed,
                    failed_op: op,
                    failure,
                });
            }

            completed.push(op);
        }

        for block in blocks {
            if self.subject.deallocate(block.addr, block.bytes).is_err() {
                return Err(Failed {
                    failed_op: AllocatorOp::Dealloc(0),
                    completed,
                    failure: Failure::DeallocRejected(block),
                });
            }
        }

        Ok(())
    }
}
