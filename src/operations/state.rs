//! Operation codes and the ordered operation state machine

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode};

/// Kind of a logged operation. The numeric values are persisted with the log
/// entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationCode {
    AddShard = 1,
    RemoveShard = 2,
    UpdateShard = 3,
    AddPointMapping = 4,
    RemovePointMapping = 5,
    UpdatePointMapping = 6,
    UpdatePointMappingWithOffline = 7,
    AddRangeMapping = 8,
    RemoveRangeMapping = 9,
    UpdateRangeMapping = 10,
    UpdateRangeMappingWithOffline = 11,
    SplitMapping = 14,
    MergeMappings = 15,
    AttachShard = 16,
    ReplaceMappings = 17,
}

impl OperationCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Result<Self> {
        let op = match code {
            1 => OperationCode::AddShard,
            2 => OperationCode::RemoveShard,
            3 => OperationCode::UpdateShard,
            4 => OperationCode::AddPointMapping,
            5 => OperationCode::RemovePointMapping,
            6 => OperationCode::UpdatePointMapping,
            7 => OperationCode::UpdatePointMappingWithOffline,
            8 => OperationCode::AddRangeMapping,
            9 => OperationCode::RemoveRangeMapping,
            10 => OperationCode::UpdateRangeMapping,
            11 => OperationCode::UpdateRangeMappingWithOffline,
            14 => OperationCode::SplitMapping,
            15 => OperationCode::MergeMappings,
            16 => OperationCode::AttachShard,
            17 => OperationCode::ReplaceMappings,
            other => {
                return Err(ShardManagementError::new(
                    ShardManagementErrorCategory::General,
                    ShardManagementErrorCode::UnexpectedError,
                    format!("unknown operation code {}", other),
                ))
            }
        };
        Ok(op)
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationCode::AddShard => "AddShard",
            OperationCode::RemoveShard => "RemoveShard",
            OperationCode::UpdateShard => "UpdateShard",
            OperationCode::AddPointMapping => "AddPointMapping",
            OperationCode::RemovePointMapping => "RemovePointMapping",
            OperationCode::UpdatePointMapping => "UpdatePointMapping",
            OperationCode::UpdatePointMappingWithOffline => "UpdatePointMappingWithOffline",
            OperationCode::AddRangeMapping => "AddRangeMapping",
            OperationCode::RemoveRangeMapping => "RemoveRangeMapping",
            OperationCode::UpdateRangeMapping => "UpdateRangeMapping",
            OperationCode::UpdateRangeMappingWithOffline => "UpdateRangeMappingWithOffline",
            OperationCode::SplitMapping => "SplitMapping",
            OperationCode::MergeMappings => "MergeMappings",
            OperationCode::AttachShard => "AttachShard",
            OperationCode::ReplaceMappings => "ReplaceMappings",
        }
    }
}

/// Position of an operation in its Do or Undo sequence. Declaration order is
/// execution order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreOperationState {
    DoBegin = 0,
    DoGlobalConnect = 1,
    DoGlobalPreLocalBeginTransaction = 2,
    DoGlobalPreLocalExecute = 3,
    DoGlobalPreLocalCommitTransaction = 4,
    DoLocalSourceConnect = 5,
    DoLocalSourceBeginTransaction = 6,
    DoLocalSourceExecute = 7,
    DoLocalSourceCommitTransaction = 8,
    DoLocalTargetConnect = 9,
    DoLocalTargetBeginTransaction = 10,
    DoLocalTargetExecute = 11,
    DoLocalTargetCommitTransaction = 12,
    DoGlobalPostLocalBeginTransaction = 13,
    DoGlobalPostLocalExecute = 14,
    DoGlobalPostLocalCommitTransaction = 15,
    DoEnd = 16,

    UndoBegin = 100,
    UndoGlobalConnect = 101,
    UndoGlobalPreLocalBeginTransaction = 102,
    UndoGlobalPreLocalExecute = 103,
    UndoGlobalPreLocalCommitTransaction = 104,
    UndoLocalTargetConnect = 105,
    UndoLocalTargetBeginTransaction = 106,
    UndoLocalTargetExecute = 107,
    UndoLocalTargetCommitTransaction = 108,
    UndoLocalSourceConnect = 109,
    UndoLocalSourceBeginTransaction = 110,
    UndoLocalSourceExecute = 111,
    UndoLocalSourceCommitTransaction = 112,
    UndoGlobalPostLocalBeginTransaction = 113,
    UndoGlobalPostLocalExecute = 114,
    UndoGlobalPostLocalCommitTransaction = 115,
    UndoEnd = 116,
}

impl StoreOperationState {
    pub fn is_undo(self) -> bool {
        self >= StoreOperationState::UndoBegin
    }

    /// Where Undo must start given the furthest Do state reached, or `None`
    /// when nothing durable needs reverting.
    pub fn undo_start_for(max_do_state: StoreOperationState) -> Option<StoreOperationState> {
        use StoreOperationState::*;
        if max_do_state < DoGlobalPreLocalCommitTransaction || max_do_state >= DoEnd {
            None
        } else if max_do_state < DoLocalSourceBeginTransaction {
            Some(UndoGlobalPostLocalBeginTransaction)
        } else if max_do_state < DoLocalTargetBeginTransaction {
            Some(UndoLocalSourceConnect)
        } else {
            Some(UndoLocalTargetConnect)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StoreOperationState::*;

    #[test]
    fn test_operation_codes_round_trip() {
        for code in [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 14, 15, 16, 17] {
            assert_eq!(OperationCode::from_code(code).unwrap().code(), code);
        }
        assert!(OperationCode::from_code(12).is_err());
        assert!(OperationCode::from_code(0).is_err());
    }

    #[test]
    fn test_states_are_totally_ordered() {
        assert!(DoGlobalPreLocalExecute < DoLocalSourceExecute);
        assert!(DoLocalTargetExecute < DoGlobalPostLocalExecute);
        assert!(DoEnd < UndoBegin);
        assert!(UndoLocalTargetExecute < UndoLocalSourceExecute);
        assert!(UndoLocalSourceExecute < UndoGlobalPostLocalExecute);
        assert!(UndoEnd.is_undo() && !DoEnd.is_undo());
    }

    #[test]
    fn test_undo_start_follows_progress() {
        assert_eq!(StoreOperationState::undo_start_for(DoGlobalPreLocalExecute), None);
        assert_eq!(
            StoreOperationState::undo_start_for(DoGlobalPreLocalCommitTransaction),
            Some(UndoGlobalPostLocalBeginTransaction)
        );
        assert_eq!(
            StoreOperationState::undo_start_for(DoLocalSourceConnect),
            Some(UndoGlobalPostLocalBeginTransaction)
        );
        assert_eq!(
            StoreOperationState::undo_start_for(DoLocalSourceExecute),
            Some(UndoLocalSourceConnect)
        );
        assert_eq!(
            StoreOperationState::undo_start_for(DoGlobalPostLocalExecute),
            Some(UndoLocalTargetConnect)
        );
        assert_eq!(StoreOperationState::undo_start_for(DoEnd), None);
    }
}
