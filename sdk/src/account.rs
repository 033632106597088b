use {
    crate::{
        clock::{Epoch, INITIAL_RENT_EPOCH},
        instruction::InstructionError,
        pubkey::Pubkey,
        sysvar::Sysvar,
    },
    serde::{de::DeserializeOwned, Serialize},
    serde_derive::{Deserialize, Serialize},
};

/// An Account with data that is stored on chain
#[derive(PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSharedData {
    /// lamports in the account
    lamports: u64,
    /// data held in this account
    data: Vec<u8>,
    /// the program that owns this account. If executable, the program that loads this account.
    owner: Pubkey,
    /// this account's data contains a loaded program (and is now read-only)
    executable: bool,
    /// the epoch at which this account will next owe rent
    rent_epoch: Epoch,
}

pub trait WritableAccount: ReadableAccount {
    fn set_lamports(&mut self, lamports: u64);
    fn checked_add_lamports(&mut self, lamports: u64) -> Result<(), InstructionError> {
        self.set_lamports(
            self.lamports()
                .checked_add(lamports)
                .ok_or(InstructionError::ArithmeticOverflow)?,
        );
        Ok(())
    }
    fn checked_sub_lamports(&mut self, lamports: u64) -> Result<(), InstructionError> {
        self.set_lamports(
            self.lamports()
                .checked_sub(lamports)
                .ok_or(InstructionError::ArithmeticOverflow)?,
        );
        Ok(())
    }
    fn data_as_mut_slice(&mut self) -> &mut [u8];
    fn set_owner(&mut self, owner: Pubkey);
    fn copy_into_owner_from_slice(&mut self, source: &[u8]);
    fn set_executable(&mut self, executable: bool);
    fn set_rent_epoch(&mut self, epoch: Epoch);
}

pub trait ReadableAccount: Sized {
    fn lamports(&self) -> u64;
    fn data(&self) -> &[u8];
    fn owner(&self) -> &Pubkey;
    fn executable(&self) -> bool;
    fn rent_epoch(&self) -> Epoch;
}

impl ReadableAccount for AccountSharedData {
    fn lamports(&self) -> u64 {
        self.lamports
    }
    fn data(&self) -> &[u8] {
        &self.data
    }
    fn owner(&self) -> &Pubkey {
        &self.owner
    }
    fn executable(&self) -> bool {
        self.executable
    }
    fn rent_epoch(&self) -> Epoch {
        self.rent_epoch
    }
}

impl WritableAccount for AccountSharedData {
    fn set_lamports(&mut self, lamports: u64) {
        self.lamports = lamports;
    }
    fn data_as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
    fn set_owner(&mut self, owner: Pubkey) {
        self.owner = owner;
    }
    fn copy_into_owner_from_slice(&mut self, source: &[u8]) {
        self.owner.as_mut().copy_from_slice(source);
    }
    fn set_executable(&mut self, executable: bool) {
        self.executable = executable;
    }
    fn set_rent_epoch(&mut self, epoch: Epoch) {
        self.rent_epoch = epoch;
    }
}

impl std::fmt::Debug for AccountSharedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSharedData")
            .field("lamports", &self.lamports)
            .field("data.len", &self.data.len())
            .field("owner", &self.owner)
            .field("executable", &self.executable)
            .field("rent_epoch", &self.rent_epoch)
            .finish()
    }
}

impl AccountSharedData {
    pub fn new(lamports: u64, space: usize, owner: &Pubkey) -> Self {
        Self {
            lamports,
            data: vec![0u8; space],
            owner: *owner,
            executable: false,
            rent_epoch: INITIAL_RENT_EPOCH,
        }
    }

    pub fn new_data<T: Serialize>(
        lamports: u64,
        state: &T,
        owner: &Pubkey,
    ) -> Result<Self, bincode::Error> {
        let data = bincode::serialize(state)?;
        Ok(Self {
            lamports,
            data,
            owner: *owner,
            executable: false,
            rent_epoch: INITIAL_RENT_EPOCH,
        })
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn set_data_from_slice(&mut self, new_data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(new_data);
    }

    pub fn resize(&mut self, new_len: usize, value: u8) {
        self.data.resize(new_len, value);
    }

    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn deserialize_data<T: DeserializeOwned>(&self) -> Result<T, bincode::Error> {
        bincode::deserialize(&self.data)
    }

    pub fn serialize_data<T: Serialize>(&mut self, state: &T) -> Result<(), bincode::Error> {
        if bincode::serialized_size(state)? > self.data.len() as u64 {
            return Err(Box::new(bincode::ErrorKind::SizeLimit));
        }
        bincode::serialize_into(&mut self.data[..], state)
    }
}

/// Convenience trait to covert bincode errors to instruction errors.
pub trait StateMut<T> {
    fn state(&self) -> Result<T, InstructionError>;
    fn set_state(&mut self, state: &T) -> Result<(), InstructionError>;
}

impl<T> StateMut<T> for AccountSharedData
where
    T: Serialize + DeserializeOwned,
{
    fn state(&self) -> Result<T, InstructionError> {
        self.deserialize_data()
            .map_err(|_| InstructionError::InvalidAccountData)
    }
    fn set_state(&mut self, state: &T) -> Result<(), InstructionError> {
        self.serialize_data(state).map_err(|err| match *err {
            bincode::ErrorKind::SizeLimit => InstructionError::AccountDataTooSmall,
            _ => InstructionError::GenericError,
        })
    }
}

/// Create an `Account` from a `Sysvar`, sized to hold it.
pub fn create_account_shared_data_for_test<S: Sysvar>(sysvar: &S) -> AccountSharedData {
    let data_len = S::size_of().max(bincode::serialized_size(sysvar).unwrap_or_default() as usize);
    let mut account = AccountSharedData::new(1, data_len, &crate::sysvar::id());
    // a freshly sized sysvar account always fits its value
    let _ = account.serialize_data(sysvar);
    account
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{clock::Clock, rent::Rent},
    };

    #[test]
    fn test_account_state() {
        let mut account = AccountSharedData::new(1, 8, &Pubkey::new_unique());
        account.set_state(&42u64).unwrap();
        assert_eq!(StateMut::<u64>::state(&account).unwrap(), 42);
        assert_eq!(
            account.set_state(&(1u64, 2u64)),
            Err(InstructionError::AccountDataTooSmall)
        );
    }

    #[test]
    fn test_checked_lamports() {
        let mut account = AccountSharedData::new(u64::MAX, 0, &Pubkey::new_unique());
        assert_eq!(
            account.checked_add_lamports(1),
            Err(InstructionError::ArithmeticOverflow)
        );
        account.set_lamports(0);
        assert_eq!(
            account.checked_sub_lamports(1),
            Err(InstructionError::ArithmeticOverflow)
        );
    }

    #[test]
    fn test_sysvar_account() {
        let clock = Clock {
            slot: 7,
            ..Clock::default()
        };
        let account = create_account_shared_data_for_test(&clock);
        assert_eq!(account.deserialize_data::<Clock>().unwrap(), clock);
        let account = create_account_shared_data_for_test(&Rent::default());
        assert_eq!(account.deserialize_data::<Rent>().unwrap(), Rent::default());
    }
}
