//! Serialization of the Module, ModulePackages and ModuleMainClass
//! attributes.
use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::ByteVector;
use crate::error::Result;
use crate::flags::AccessFlags;
use crate::sink::ModuleSink;
use crate::symbols::SymbolTable;

/// Event sink accumulating the directives of one module declaration.
pub struct ModuleWriter {
    symbols: Rc<RefCell<SymbolTable>>,
    module_index: u16,
    flags: AccessFlags,
    version_index: u16,
    main_class_index: u16,
    packages: ByteVector,
    package_count: u16,
    requires: ByteVector,
    require_count: u16,
    exports: ByteVector,
    export_count: u16,
    opens: ByteVector,
    open_count: u16,
    uses: ByteVector,
    use_count: u16,
    provides: ByteVector,
    provide_count: u16,
}

impl ModuleWriter {
    pub(crate) fn new(
        symbols: Rc<RefCell<SymbolTable>>,
        name: &str,
        flags: AccessFlags,
        version: Option<&str>,
    ) -> Result<ModuleWriter> {
        let (module_index, version_index) = {
            let mut table = symbols.borrow_mut();
            let module_index = table.module(name)?;
            let version_index = match version {
                Some(version) => table.utf8(version)?,
                None => 0,
            };
            (module_index, version_index)
        };
        Ok(ModuleWriter {
            symbols,
            module_index,
            flags,
            version_index,
            main_class_index: 0,
            packages: ByteVector::new(),
            package_count: 0,
            requires: ByteVector::new(),
            require_count: 0,
            exports: ByteVector::new(),
            export_count: 0,
            opens: ByteVector::new(),
            open_count: 0,
            uses: ByteVector::new(),
            use_count: 0,
            provides: ByteVector::new(),
            provide_count: 0,
        })
    }

    pub(crate) fn has_main_class(&self) -> bool {
        self.main_class_index != 0
    }

    pub(crate) fn has_packages(&self) -> bool {
        self.package_count != 0
    }

    /// Payload of the Module attribute.
    pub(crate) fn put_module(&self, out: &mut ByteVector) {
        out.put_u16(self.module_index);
        out.put_u16(self.flags.wire_bits());
        out.put_u16(self.version_index);
        out.put_u16(self.require_count);
        out.put_bytes(self.requires.as_slice());
        out.put_u16(self.export_count);
        out.put_bytes(self.exports.as_slice());
        out.put_u16(self.open_count);
        out.put_bytes(self.opens.as_slice());
        out.put_u16(self.use_count);
        out.put_bytes(self.uses.as_slice());
        out.put_u16(self.provide_count);
        out.put_bytes(self.provides.as_slice());
    }

    pub(crate) fn module_len(&self) -> usize {
        16 + self.requires.len()
            + self.exports.len()
            + self.opens.len()
            + self.uses.len()
            + self.provides.len()
    }

    /// Payload of the ModulePackages attribute.
    pub(crate) fn put_packages(&self, out: &mut ByteVector) {
        out.put_u16(self.package_count);
        out.put_bytes(self.packages.as_slice());
    }

    pub(crate) fn packages_len(&self) -> usize {
        2 + self.packages.len()
    }

    /// Payload of the ModuleMainClass attribute.
    pub(crate) fn main_class_index(&self) -> u16 {
        self.main_class_index
    }
}

impl ModuleSink for ModuleWriter {
    fn visit_main_class(&mut self, main_class: &str) -> Result<()> {
        self.main_class_index = self.symbols.borrow_mut().class(main_class)?;
        Ok(())
    }

    fn visit_package(&mut self, package: &str) -> Result<()> {
        let index = self.symbols.borrow_mut().package(package)?;
        self.packages.put_u16(index);
        self.package_count += 1;
        Ok(())
    }

    fn visit_require(
        &mut self,
        module: &str,
        access: AccessFlags,
        version: Option<&str>,
    ) -> Result<()> {
        let mut symbols = self.symbols.borrow_mut();
        let module_index = symbols.module(module)?;
        let version_index = match version {
            Some(version) => symbols.utf8(version)?,
            None => 0,
        };
        self.requires.put_u16(module_index);
        self.requires.put_u16(access.wire_bits());
        self.requires.put_u16(version_index);
        self.require_count += 1;
        Ok(())
    }

    fn visit_export(&mut self, package: &str, access: AccessFlags, modules: &[&str]) -> Result<()> {
        let mut symbols = self.symbols.borrow_mut();
        let package_index = symbols.package(package)?;
        self.exports.put_u16(package_index);
        self.exports.put_u16(access.wire_bits());
        self.exports.put_u16(modules.len() as u16);
        for module in modules {
            let index = symbols.module(module)?;
            self.exports.put_u16(index);
        }
        self.export_count += 1;
        Ok(())
    }

    fn visit_open(&mut self, package: &str, access: AccessFlags, modules: &[&str]) -> Result<()> {
        let mut symbols = self.symbols.borrow_mut();
        let package_index = symbols.package(package)?;
        self.opens.put_u16(package_index);
        self.opens.put_u16(access.wire_bits());
        self.opens.put_u16(modules.len() as u16);
        for module in modules {
            let index = symbols.module(module)?;
            self.opens.put_u16(index);
        }
        self.open_count += 1;
        Ok(())
    }

    fn visit_use(&mut self, service: &str) -> Result<()> {
        let index = self.symbols.borrow_mut().class(service)?;
        self.uses.put_u16(index);
        self.use_count += 1;
        Ok(())
    }

    fn visit_provide(&mut self, service: &str, providers: &[&str]) -> Result<()> {
        let mut symbols = self.symbols.borrow_mut();
        let service_index = symbols.class(service)?;
        self.provides.put_u16(service_index);
        self.provides.put_u16(providers.len() as u16);
        for provider in providers {
            let index = symbols.class(provider)?;
            self.provides.put_u16(index);
        }
        self.provide_count += 1;
        Ok(())
    }

    fn visit_end(&mut self) -> Result<()> {
        Ok(())
    }
}
