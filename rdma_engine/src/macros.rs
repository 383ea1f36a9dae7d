/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

/// Declares the set of task kinds. For every `(Op, Variant, field)` entry this
/// generates the `AnyTask::Variant` arm, the `TaskConfs::field` slot and the
/// `TaskKind` impl for `Op` (which must provide an inherent
/// `fn check(&self, &TaskLimits) -> Result<()>`).
macro_rules! task_kinds {
    ($(($op:ident, $variant:ident, $field:ident)),* $(,)?) => {
        /// A task of any kind, as held by the engine while it is outstanding.
        #[derive(Debug)]
        pub enum AnyTask {
            $($variant($crate::task::Task<$op>),)*
        }

        /// Per-kind task configuration of a context.
        #[doc(hidden)]
        #[derive(Default)]
        pub struct TaskConfs {
            $(pub(crate) $field: Option<$crate::task::TaskConf<$op>>,)*
        }

        $(
            impl sealed::Sealed for $op {}

            impl $crate::task::TaskKind for $op {
                const TYPE: $crate::primitives::TaskType = $crate::primitives::TaskType::$variant;

                fn into_any(task: $crate::task::Task<Self>) -> AnyTask {
                    AnyTask::$variant(task)
                }

                fn conf(confs: &mut TaskConfs) -> &mut Option<$crate::task::TaskConf<Self>> {
                    &mut confs.$field
                }

                fn validate(&self, limits: &TaskLimits) -> $crate::error::Result<()> {
                    self.check(limits)
                }
            }
        )*

        impl AnyTask {
            pub fn task_type(&self) -> $crate::primitives::TaskType {
                match self {
                    $(AnyTask::$variant(_) => $crate::primitives::TaskType::$variant,)*
                }
            }

            pub(crate) fn header(&self) -> &TaskHeader {
                match self {
                    $(AnyTask::$variant(task) => &task.header,)*
                }
            }

            pub(crate) fn header_mut(&mut self) -> &mut TaskHeader {
                match self {
                    $(AnyTask::$variant(task) => &mut task.header,)*
                }
            }
        }

        impl TaskConfs {
            /// Pool capacity per kind; zero for unconfigured kinds.
            pub(crate) fn num_tasks(&self) -> [u32; $crate::primitives::TaskType::COUNT] {
                let mut sizes = [0u32; $crate::primitives::TaskType::COUNT];
                $(
                    if let Some(conf) = &self.$field {
                        sizes[$crate::primitives::TaskType::$variant.index()] = conf.num_tasks;
                    }
                )*
                sizes
            }
        }
    };
}
